// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery: reactive recycling, retries and dead workers.

mod common;

use common::{pool_config, request, start, wait_until};
use infergate_core::proxy::{MockProxy, MockReply};
use infergate_core::{DispatchConfig, DispatchError, DrainReason, PoolEvent, WorkerState};

fn crash() -> MockReply {
    MockReply::Status(500, r#"{"detail":"CUDA out of memory"}"#.to_string())
}

#[tokio::test]
async fn test_crash_status_restarts_worker_and_retries() {
    let proxy = MockProxy::new();
    proxy.push_reply(crash());
    let gw = start(pool_config(1, 2), DispatchConfig::default(), proxy).await;
    let mut events = gw.runtime.pool().subscribe();

    let response = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(gw.proxy.calls(), vec![8001, 8001]);

    let worker = gw.runtime.pool().worker(0).unwrap();
    assert_eq!(worker.state, WorkerState::Active);
    assert_eq!(worker.restarts, 1);
    assert_eq!(worker.in_flight, 0);
    assert_eq!(gw.supervisor.spawn_count(), 2);
    assert_eq!(gw.supervisor.stop_count(), 1);

    assert!(matches!(
        events.recv().await.unwrap(),
        PoolEvent::Draining {
            reason: DrainReason::BackendFailure,
            ..
        }
    ));
    assert!(matches!(events.recv().await.unwrap(), PoolEvent::Restarted { .. }));
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_status_exhausts_retries() {
    let proxy = MockProxy::new();
    proxy.push_reply(crash());
    proxy.push_reply(crash());
    let gw = start(pool_config(1, 2), DispatchConfig::default(), proxy).await;

    let err = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap_err();

    assert_eq!(
        err,
        DispatchError::RetriesExhausted {
            attempts: 2,
            status: 500
        }
    );
    assert_eq!(err.envelope().code, 500);
    assert_eq!(gw.runtime.pool().worker(0).unwrap().restarts, 2);
    assert_eq!(gw.runtime.pool().in_flight_total(), 0);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_retries_resolves_after_first_crash() {
    let proxy = MockProxy::new();
    proxy.push_reply(crash());
    let gw = start(
        pool_config(1, 1),
        DispatchConfig::default().with_crash_restart(true, 0),
        proxy,
    )
    .await;

    let err = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap_err();

    assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 1, .. }));
    assert_eq!(gw.proxy.calls().len(), 1);
    assert_eq!(gw.runtime.pool().worker(0).unwrap().restarts, 1);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_restart_disabled_passes_status_through() {
    let proxy = MockProxy::new();
    proxy.push_reply(crash());
    let gw = start(
        pool_config(1, 1),
        DispatchConfig::default().with_crash_restart(false, 1),
        proxy,
    )
    .await;

    let response = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap();

    assert_eq!(response.status, 500);
    assert_eq!(&response.body[..], br#"{"detail":"CUDA out of memory"}"#);
    assert_eq!(gw.runtime.pool().worker(0).unwrap().restarts, 0);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_crash_reports_restart_once() {
    let proxy = MockProxy::new();
    proxy.push_reply_for(8001, crash());
    proxy.push_reply_for(8001, crash());
    let gw = start(pool_config(1, 2), DispatchConfig::default(), proxy).await;

    let a = gw.runtime.submit(request(0)).unwrap();
    let b = gw.runtime.submit(request(1)).unwrap();
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap().unwrap().status, 200);
    assert_eq!(b.unwrap().unwrap().status, 200);
    let restarts = gw.runtime.pool().worker(0).unwrap().restarts;
    assert!((1..=2).contains(&restarts));
    assert_eq!(gw.runtime.pool().in_flight_total(), 0);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_restart_marks_worker_dead_and_fails_over() {
    let proxy = MockProxy::new();
    proxy.push_reply_for(8001, crash());
    let gw = start(pool_config(2, 1), DispatchConfig::default(), proxy).await;
    let mut events = gw.runtime.pool().subscribe();

    gw.supervisor.fail_next_spawns(3);
    let response = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap();

    // retried on the surviving worker
    assert_eq!(response.status, 200);
    assert_eq!(gw.proxy.calls(), vec![8001, 8002]);

    let dead = gw.runtime.pool().worker(0).unwrap();
    assert_eq!(dead.state, WorkerState::Dead);
    assert_eq!(gw.runtime.pool().live_workers(), 1);

    let _draining = events.recv().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        PoolEvent::Dead { worker: 0, port: 8001, .. }
    ));

    // dead workers are never revived or selected
    for n in 1..4 {
        gw.runtime.submit(request(n)).unwrap().await.unwrap().unwrap();
    }
    assert!(gw.proxy.calls()[2..].iter().all(|&port| port == 8002));
    assert_eq!(gw.runtime.pool().worker(0).unwrap().state, WorkerState::Dead);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_all_workers_dead_rejects_requests() {
    let proxy = MockProxy::new();
    proxy.push_reply(crash());
    let gw = start(pool_config(1, 1), DispatchConfig::default(), proxy).await;

    gw.supervisor.fail_next_spawns(3);
    let err = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap_err();

    assert_eq!(err, DispatchError::NoWorkers);
    assert_eq!(err.status_code(), 503);
    assert!(!gw.runtime.pool().has_live_workers());

    let err = gw.runtime.submit(request(1)).unwrap().await.unwrap().unwrap_err();
    assert_eq!(err, DispatchError::NoWorkers);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_that_dies_during_restart_warmup_is_retried() {
    let proxy = MockProxy::new();
    proxy.push_reply(crash());
    let gw = start(pool_config(1, 1), DispatchConfig::default(), proxy).await;

    // first respawn exits during warm-up, second sticks
    gw.supervisor.crash_next_spawns(1);
    let response = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(gw.supervisor.spawn_count(), 3);
    wait_until("worker active", || {
        gw.runtime.pool().worker(0).unwrap().state == WorkerState::Active
    })
    .await;
    assert_eq!(gw.runtime.pool().worker(0).unwrap().restarts, 1);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_failure_from_dead_process_restarts_worker() {
    let proxy = MockProxy::new();
    proxy.push_reply_for(8001, MockReply::Refused);
    let gw = start(pool_config(2, 1), DispatchConfig::default(), proxy).await;
    let mut events = gw.runtime.pool().subscribe();

    // the process behind worker 0 died between requests
    gw.supervisor.kill(8001).await;
    let err = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap_err();

    // the caller still gets the transport envelope
    assert_eq!(err.status_code(), 400);
    wait_until("worker 0 restarted", || {
        let worker = gw.runtime.pool().worker(0).unwrap();
        worker.state == WorkerState::Active && worker.restarts == 1
    })
    .await;

    assert!(matches!(
        events.recv().await.unwrap(),
        PoolEvent::Draining {
            worker: 0,
            reason: DrainReason::BackendFailure,
            ..
        }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        PoolEvent::Restarted { worker: 0, .. }
    ));
    assert_eq!(gw.supervisor.running_ports().await, vec![8001, 8002]);

    let response = gw.runtime.submit(request(1)).unwrap().await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(gw.proxy.calls(), vec![8001, 8001]);
    assert_eq!(gw.runtime.pool().in_flight_total(), 0);
    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_failure_with_live_process_keeps_worker() {
    let proxy = MockProxy::new();
    proxy.push_reply_for(8001, MockReply::Reset);
    let gw = start(pool_config(2, 1), DispatchConfig::default(), proxy).await;

    let err = gw.runtime.submit(request(0)).unwrap().await.unwrap().unwrap_err();

    assert_eq!(err.status_code(), 500);
    let worker = gw.runtime.pool().worker(0).unwrap();
    assert_eq!(worker.state, WorkerState::Active);
    assert_eq!(worker.restarts, 0);
    assert_eq!(gw.supervisor.spawn_count(), 2);
    gw.runtime.shutdown().await.unwrap();
}
