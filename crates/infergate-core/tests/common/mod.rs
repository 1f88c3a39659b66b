// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for infergate-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use infergate_core::proxy::{MockProxy, ProxyRequest};
use infergate_core::runtime::GatewayRuntime;
use infergate_core::supervisor::MockSupervisor;
use infergate_core::{DispatchConfig, PoolConfig};
use reqwest::header::HeaderMap;

/// Runtime wired to mock collaborators.
pub struct TestGateway {
    pub runtime: GatewayRuntime,
    pub supervisor: Arc<MockSupervisor>,
    pub proxy: Arc<MockProxy>,
}

/// Pool configuration with no warm-up delays.
pub fn pool_config(workers: usize, max_in_flight: usize) -> PoolConfig {
    PoolConfig::default()
        .with_worker_count(workers)
        .with_max_in_flight(max_in_flight)
        .with_warmup(Duration::ZERO, Duration::ZERO)
        .with_restart_policy(3, Duration::from_millis(1))
}

/// Start a runtime with the given configuration and proxy double.
pub async fn start(pool: PoolConfig, dispatch: DispatchConfig, proxy: MockProxy) -> TestGateway {
    let supervisor = Arc::new(MockSupervisor::new());
    let proxy = Arc::new(proxy);

    let runtime = GatewayRuntime::builder()
        .supervisor(supervisor.clone())
        .proxy(proxy.clone())
        .pool_config(pool)
        .dispatch_config(dispatch)
        .build()
        .expect("valid test configuration")
        .start()
        .await
        .expect("runtime starts");

    TestGateway {
        runtime,
        supervisor,
        proxy,
    }
}

/// A POST request with a small JSON body.
pub fn request(n: usize) -> ProxyRequest {
    ProxyRequest::post(
        HeaderMap::new(),
        Bytes::from(format!(r#"{{"img":"{n}"}}"#)),
    )
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}
