// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool and restart state machine.
//!
//! Every worker moves through four states:
//!
//! ```text
//!            threshold reached / backend failure
//!   Active ─────────────────────────────────────▶ Draining
//!     ▲                                              │ in_flight == owner's slot
//!     │ spawn + warm-up ok                           ▼
//!     └──────────────────────────────────────── Restarting ──▶ Dead
//!                                                 spawn attempts exhausted
//! ```
//!
//! All field writes happen under one mutex whose critical sections never
//! span I/O. Stopping and spawning processes happens with the lock released,
//! while the worker sits in `Restarting` and is invisible to admission.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, broadcast};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::supervisor::{ProcessHandle, Supervisor, SupervisorError};

/// Index of a worker in the pool.
pub type WorkerId = usize;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Eligible for assignment.
    Active,
    /// No new assignments; waiting for outstanding work before a restart.
    Draining,
    /// Process is being stopped and started.
    Restarting,
    /// Permanently excluded after exhausting restart attempts.
    Dead,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Active => "active",
            WorkerState::Draining => "draining",
            WorkerState::Restarting => "restarting",
            WorkerState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Why a worker started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    /// Preventive recycling after `restart_threshold` assignments.
    Threshold,
    /// Reactive recycling after the worker reported a crash status.
    BackendFailure,
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainReason::Threshold => f.write_str("threshold"),
            DrainReason::BackendFailure => f.write_str("backend_failure"),
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Worker index.
    pub id: WorkerId,
    /// Port the worker listens on.
    pub port: u16,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Requests assigned and not yet completed.
    pub in_flight: usize,
    /// Assignments since the last restart.
    pub processed_since_restart: u64,
    /// Assignments after which the worker is recycled.
    pub restart_threshold: u64,
    /// Completed restarts.
    pub restarts: u64,
    /// Lease generation; bumped by every restart.
    pub generation: u64,
    /// Pending drain trigger, if draining.
    pub drain_reason: Option<DrainReason>,
    /// Process id, if known.
    pub pid: Option<u32>,
    /// When the current process was started.
    pub started_at: Option<DateTime<Utc>>,
}

struct WorkerRecord {
    id: WorkerId,
    port: u16,
    restart_threshold: u64,
    state: WorkerState,
    in_flight: usize,
    processed: u64,
    restarts: u64,
    generation: u64,
    drain_reason: Option<DrainReason>,
    handle: Option<ProcessHandle>,
}

impl WorkerRecord {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            port: self.port,
            state: self.state,
            in_flight: self.in_flight,
            processed_since_restart: self.processed,
            restart_threshold: self.restart_threshold,
            restarts: self.restarts,
            generation: self.generation,
            drain_reason: self.drain_reason,
            pid: self.handle.as_ref().and_then(|h| h.pid),
            started_at: self.handle.as_ref().map(|h| h.started_at),
        }
    }
}

/// Fixed set of worker processes with admission and restart policy.
pub struct WorkerPool {
    config: PoolConfig,
    supervisor: Arc<dyn Supervisor>,
    workers: Mutex<Vec<WorkerRecord>>,
    /// Per-worker wake-up for the drain owner.
    drained: Vec<Notify>,
    /// Wake-up for dispatchers waiting on a free slot.
    capacity: Notify,
    events: broadcast::Sender<PoolEvent>,
    /// Restart procedures in progress; shutdown waits for them.
    restarts: TaskTracker,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create the pool. Workers stay ineligible until [`start`](Self::start).
    pub fn new(config: PoolConfig, supervisor: Arc<dyn Supervisor>) -> Arc<Self> {
        let workers = (0..config.worker_count)
            .map(|id| WorkerRecord {
                id,
                port: config.port(id),
                restart_threshold: config.restart_threshold(id),
                state: WorkerState::Restarting,
                in_flight: 0,
                processed: 0,
                restarts: 0,
                generation: 0,
                drain_reason: None,
                handle: None,
            })
            .collect();
        let drained = (0..config.worker_count).map(|_| Notify::new()).collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            config,
            supervisor,
            workers: Mutex::new(workers),
            drained,
            capacity: Notify::new(),
            events,
            restarts: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerRecord>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PoolEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Spawn every worker, wait out the start-up warm-up and check liveness.
    ///
    /// Workers that did not come up go through the restart procedure; those
    /// that still fail are marked dead. Fails only if no worker is live.
    /// Returns the number of live workers.
    pub async fn start(&self) -> Result<usize, PoolError> {
        let count = self.config.worker_count;
        info!(
            workers = count,
            base_port = self.config.base_port,
            max_in_flight = self.config.max_in_flight,
            supervisor = self.supervisor.supervisor_type(),
            "Starting worker pool"
        );

        let mut launched = Vec::with_capacity(count);
        for id in 0..count {
            let port = self.config.port(id);
            match self.supervisor.spawn(port).await {
                Ok(handle) => {
                    debug!(worker = id, port = port, pid = ?handle.pid, "Worker process launched");
                    launched.push(Some(handle));
                }
                Err(e) => {
                    warn!(worker = id, port = port, error = %e, "Initial worker spawn failed");
                    launched.push(None);
                }
            }
        }

        tokio::time::sleep(self.config.startup_warmup).await;

        for (id, handle) in launched.into_iter().enumerate() {
            let outcome = match handle {
                Some(handle) if self.supervisor.is_alive(&handle).await => Ok(handle),
                stale => {
                    if let Some(handle) = &stale {
                        let exit_code = self.supervisor.exit_code(handle).await;
                        warn!(
                            worker = id,
                            port = handle.port,
                            exit_code = ?exit_code,
                            "Worker exited during start-up warm-up"
                        );
                    }
                    self.restart_process(id, stale).await
                }
            };
            self.finish_restart(id, outcome, false).await;
        }

        let live = self.live_workers();
        if live == 0 {
            return Err(PoolError::NoLiveWorkers { workers: count });
        }
        info!(live = live, workers = count, "Worker pool ready");
        Ok(live)
    }

    /// Reserve a slot on the first eligible worker in ascending order.
    ///
    /// Increments `in_flight` and `processed_since_restart` in the same
    /// critical section as the scan.
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerLease> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let cap = self.config.max_in_flight;
        let mut workers = self.lock();
        let worker = workers
            .iter_mut()
            .find(|w| w.state == WorkerState::Active && w.in_flight < cap)?;

        worker.in_flight += 1;
        worker.processed += 1;
        debug_assert!(worker.in_flight <= cap);

        Some(WorkerLease {
            pool: Arc::clone(self),
            worker: worker.id,
            port: worker.port,
            generation: worker.generation,
            ordinal: worker.processed,
            drain_owner: false,
            settled: false,
        })
    }

    /// Preventive trigger: start draining if this assignment reached the
    /// worker's restart threshold. The lease becomes the drain owner.
    pub fn threshold_check(&self, lease: &mut WorkerLease) -> bool {
        let ordinal = lease.ordinal;
        self.begin_drain(lease, DrainReason::Threshold, |w| {
            ordinal >= w.restart_threshold
        })
    }

    /// Reactive trigger: start draining after a backend failure.
    ///
    /// Ignored unless the worker is still `Active`. The lease becomes the
    /// drain owner when it returns `true`.
    pub fn note_failure(&self, lease: &mut WorkerLease) -> bool {
        self.begin_drain(lease, DrainReason::BackendFailure, |_| true)
    }

    fn begin_drain(
        &self,
        lease: &mut WorkerLease,
        reason: DrainReason,
        trigger: impl FnOnce(&WorkerRecord) -> bool,
    ) -> bool {
        let (event, threshold) = {
            let mut workers = self.lock();
            let w = &mut workers[lease.worker];
            if w.generation != lease.generation || w.state != WorkerState::Active || !trigger(w) {
                return false;
            }
            w.state = WorkerState::Draining;
            w.drain_reason = Some(reason);
            (
                PoolEvent::Draining {
                    worker: w.id,
                    port: w.port,
                    reason,
                },
                w.restart_threshold,
            )
        };

        lease.drain_owner = true;
        info!(
            worker = lease.worker,
            port = lease.port,
            reason = %reason,
            ordinal = lease.ordinal,
            threshold = threshold,
            "Worker draining"
        );
        self.emit(event);
        true
    }

    /// Drive a restart with the drain-owning lease.
    ///
    /// Waits until the lease holds the only outstanding slot, then stops and
    /// respawns the process. The restart settles the lease. Returns `true`
    /// if the worker came back `Active`.
    pub async fn recycle(&self, mut lease: WorkerLease) -> bool {
        if !lease.drain_owner {
            error!(
                worker = lease.worker,
                "Recycle requested by a lease that does not own the drain"
            );
            debug_assert!(lease.drain_owner, "recycle without drain ownership");
            return false;
        }

        let Some(old) = self.wait_drained(lease.worker, lease.generation, 1).await else {
            return false;
        };
        lease.settled = true;
        self.restart_and_finish(lease.worker, old).await
    }

    /// Restart a draining worker whose drain owner went away.
    async fn recycle_orphan(self: Arc<Self>, id: WorkerId, generation: u64) {
        if let Some(old) = self.wait_drained(id, generation, 0).await {
            self.restart_and_finish(id, old).await;
        }
    }

    /// Wait until at most `held` slots remain on a draining worker, then move
    /// it to `Restarting` and take its process handle.
    ///
    /// Returns `None` if the worker left the draining state of `generation`.
    async fn wait_drained(
        &self,
        id: WorkerId,
        generation: u64,
        held: usize,
    ) -> Option<Option<ProcessHandle>> {
        loop {
            let notified = self.drained[id].notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut workers = self.lock();
                let w = &mut workers[id];
                if self.closed.load(Ordering::SeqCst)
                    || w.generation != generation
                    || w.state != WorkerState::Draining
                {
                    return None;
                }
                if w.in_flight <= held {
                    w.state = WorkerState::Restarting;
                    return Some(w.handle.take());
                }
                debug!(worker = id, in_flight = w.in_flight, "Waiting for worker to drain");
            }

            notified.await;
        }
    }

    async fn restart_and_finish(&self, id: WorkerId, old: Option<ProcessHandle>) -> bool {
        self.restarts
            .track_future(async {
                if self.closed.load(Ordering::SeqCst) {
                    if let Some(old) = old {
                        let _ = self.supervisor.stop(&old).await;
                    }
                    return false;
                }
                info!(worker = id, port = self.config.port(id), "Restarting worker");
                let outcome = self.restart_process(id, old).await;
                self.finish_restart(id, outcome, true).await
            })
            .await
    }

    /// Stop `old`, then spawn with bounded attempts and exponential backoff.
    async fn restart_process(
        &self,
        id: WorkerId,
        old: Option<ProcessHandle>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let port = self.config.port(id);
        if let Some(old) = old
            && let Err(e) = self.supervisor.stop(&old).await
        {
            warn!(worker = id, port = port, error = %e, "Failed to stop worker process");
        }

        let attempts = self.config.restart_attempts;
        let mut backoff = self.config.restart_backoff;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.launch(port).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(
                        worker = id,
                        port = port,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Worker spawn attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SupervisorError::SpawnFailed(format!("no spawn attempts made for port {port}"))
        }))
    }

    /// Spawn one process and confirm it survives the restart warm-up.
    async fn launch(&self, port: u16) -> Result<ProcessHandle, SupervisorError> {
        let handle = self.supervisor.spawn(port).await?;
        tokio::time::sleep(self.config.restart_warmup).await;

        if self.supervisor.is_alive(&handle).await {
            return Ok(handle);
        }
        let exit_code = self.supervisor.exit_code(&handle).await;
        let _ = self.supervisor.stop(&handle).await;
        Err(SupervisorError::EarlyExit { port, exit_code })
    }

    /// Record the outcome of a restart procedure and wake dispatchers.
    ///
    /// A process that came up after shutdown began is stopped instead of
    /// being installed.
    async fn finish_restart(
        &self,
        id: WorkerId,
        outcome: Result<ProcessHandle, SupervisorError>,
        recycled: bool,
    ) -> bool {
        let mut stray = None;
        let (event, live) = {
            let mut workers = self.lock();
            let w = &mut workers[id];
            w.in_flight = 0;
            w.processed = 0;
            w.drain_reason = None;
            w.generation += 1;
            match outcome {
                // checked under the lock so shutdown cannot miss the handle
                Ok(handle) if self.closed.load(Ordering::SeqCst) => {
                    stray = Some(handle);
                    (None, false)
                }
                Ok(handle) => {
                    let pid = handle.pid;
                    w.state = WorkerState::Active;
                    w.handle = Some(handle);
                    if recycled {
                        w.restarts += 1;
                        info!(
                            worker = id,
                            port = w.port,
                            pid = ?pid,
                            restarts = w.restarts,
                            "Worker restarted"
                        );
                        (
                            Some(PoolEvent::Restarted {
                                worker: id,
                                port: w.port,
                                restarts: w.restarts,
                                pid,
                            }),
                            true,
                        )
                    } else {
                        (None, true)
                    }
                }
                Err(e) => {
                    w.state = WorkerState::Dead;
                    w.handle = None;
                    error!(
                        worker = id,
                        port = w.port,
                        error = %e,
                        "Worker is dead, excluded from the pool"
                    );
                    (
                        Some(PoolEvent::Dead {
                            worker: id,
                            port: w.port,
                            error: e.to_string(),
                        }),
                        false,
                    )
                }
            }
        };

        if let Some(handle) = stray {
            info!(worker = id, port = handle.port, "Stopping worker started during shutdown");
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!(worker = id, port = handle.port, error = %e, "Failed to stop worker process");
            }
        }
        if let Some(event) = event {
            self.emit(event);
        }
        self.capacity.notify_waiters();
        live
    }

    /// Return one slot. Called from [`WorkerLease`] only.
    fn release_slot(&self, id: WorkerId, generation: u64) {
        let state = {
            let mut workers = self.lock();
            let w = &mut workers[id];
            if w.generation != generation {
                error!(
                    worker = id,
                    lease_generation = generation,
                    generation = w.generation,
                    "Ignoring release of a stale lease"
                );
                debug_assert_eq!(w.generation, generation, "stale lease released");
                return;
            }
            if w.in_flight == 0 {
                error!(worker = id, "Ignoring release without a matching acquire");
                debug_assert!(w.in_flight > 0, "release without acquire");
                return;
            }
            w.in_flight -= 1;
            w.state
        };

        match state {
            WorkerState::Draining => self.drained[id].notify_one(),
            WorkerState::Active => self.capacity.notify_waiters(),
            WorkerState::Restarting | WorkerState::Dead => {}
        }
    }

    /// Future resolved on the next release or restart completion.
    ///
    /// Call `enable()` on it before checking for capacity so a wake-up
    /// between the check and the wait is not lost.
    pub fn capacity_changed(&self) -> Notified<'_> {
        self.capacity.notified()
    }

    /// Whether any worker is not permanently dead.
    pub fn has_live_workers(&self) -> bool {
        self.lock().iter().any(|w| w.state != WorkerState::Dead)
    }

    /// Number of workers that are not dead.
    pub fn live_workers(&self) -> usize {
        self.lock()
            .iter()
            .filter(|w| w.state != WorkerState::Dead)
            .count()
    }

    /// Sum of `in_flight` across workers.
    pub fn in_flight_total(&self) -> usize {
        self.lock().iter().map(|w| w.in_flight).sum()
    }

    /// Snapshot of every worker.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.lock().iter().map(WorkerRecord::snapshot).collect()
    }

    /// Snapshot of one worker.
    pub fn worker(&self, id: WorkerId) -> Option<WorkerSnapshot> {
        self.lock().get(id).map(WorkerRecord::snapshot)
    }

    /// Whether the process behind `lease` is still running.
    ///
    /// A lease from an earlier generation reports `true`: its process was
    /// already replaced.
    pub async fn is_process_alive(&self, lease: &WorkerLease) -> bool {
        let handle = {
            let workers = self.lock();
            let w = &workers[lease.worker];
            if w.generation != lease.generation {
                return true;
            }
            w.handle.clone()
        };
        match handle {
            Some(handle) => self.supervisor.is_alive(&handle).await,
            None => false,
        }
    }

    /// Stop admitting, stop every worker process and wait for restart
    /// procedures still in progress.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.restarts.close();
        let handles: Vec<ProcessHandle> = self
            .lock()
            .iter_mut()
            .filter_map(|w| w.handle.take())
            .collect();
        self.capacity.notify_waiters();
        for drained in &self.drained {
            drained.notify_waiters();
        }

        info!(processes = handles.len(), "Stopping worker processes");
        let results = join_all(handles.iter().map(|h| self.supervisor.stop(h))).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!(port = handle.port, error = %e, "Failed to stop worker process");
            }
        }

        if !self.restarts.is_empty() {
            info!(restarts = self.restarts.len(), "Waiting for worker restarts to settle");
        }
        self.restarts.wait().await;
    }
}

/// A reserved slot on one worker.
///
/// Dropping the lease releases the slot exactly once. A lease that drove a
/// restart is settled by it and releases nothing.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    worker: WorkerId,
    port: u16,
    generation: u64,
    ordinal: u64,
    drain_owner: bool,
    settled: bool,
}

impl WorkerLease {
    /// Worker index.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Worker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Generation of the worker when the slot was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Value of `processed_since_restart` right after this assignment.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Whether this lease triggered the worker's current drain.
    pub fn owns_drain(&self) -> bool {
        self.drain_owner
    }

    /// Release the slot.
    pub fn release(self) {}
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker)
            .field("port", &self.port)
            .field("generation", &self.generation)
            .field("ordinal", &self.ordinal)
            .field("drain_owner", &self.drain_owner)
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.pool.release_slot(self.worker, self.generation);

        if self.drain_owner {
            warn!(
                worker = self.worker,
                "Drain owner released without restarting, restarting in background"
            );
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let pool = Arc::clone(&self.pool);
                runtime.spawn(pool.recycle_orphan(self.worker, self.generation));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::MockSupervisor;
    use std::time::Duration;

    fn config(workers: usize, cap: usize) -> PoolConfig {
        PoolConfig::default()
            .with_worker_count(workers)
            .with_max_in_flight(cap)
            .with_warmup(Duration::ZERO, Duration::ZERO)
            .with_restart_policy(3, Duration::from_millis(1))
    }

    async fn started(config: PoolConfig) -> (Arc<WorkerPool>, Arc<MockSupervisor>) {
        let supervisor = Arc::new(MockSupervisor::new());
        let pool = WorkerPool::new(config, supervisor.clone());
        pool.start().await.unwrap();
        (pool, supervisor)
    }

    #[tokio::test]
    async fn test_not_eligible_before_start() {
        let pool = WorkerPool::new(config(2, 1), Arc::new(MockSupervisor::new()));
        assert!(pool.try_acquire().is_none());
        assert!(
            pool.snapshot()
                .iter()
                .all(|w| w.state == WorkerState::Restarting)
        );
    }

    #[tokio::test]
    async fn test_start_activates_all_workers() {
        let (pool, supervisor) = started(config(3, 2)).await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|w| w.state == WorkerState::Active));
        assert_eq!(
            snapshot.iter().map(|w| w.restart_threshold).collect::<Vec<_>>(),
            vec![100, 200, 300]
        );
        assert_eq!(supervisor.running_ports().await, vec![8001, 8002, 8003]);
    }

    #[tokio::test]
    async fn test_acquire_fills_in_ascending_order_up_to_cap() {
        let (pool, _) = started(config(3, 2)).await;

        let leases: Vec<WorkerLease> = std::iter::from_fn(|| pool.try_acquire()).collect();
        let ports: Vec<u16> = leases.iter().map(WorkerLease::port).collect();

        assert_eq!(ports, vec![8001, 8001, 8002, 8002, 8003, 8003]);
        assert_eq!(pool.in_flight_total(), 6);
        assert!(pool.try_acquire().is_none());

        drop(leases);
        assert_eq!(pool.in_flight_total(), 0);
    }

    #[tokio::test]
    async fn test_release_counts_each_lease_once() {
        let (pool, _) = started(config(1, 2)).await;

        let first = pool.try_acquire().unwrap();
        let second = pool.try_acquire().unwrap();
        assert_eq!(first.ordinal(), 1);
        assert_eq!(second.ordinal(), 2);

        first.release();
        assert_eq!(pool.worker(0).unwrap().in_flight, 1);
        drop(second);
        assert_eq!(pool.worker(0).unwrap().in_flight, 0);
        assert_eq!(pool.worker(0).unwrap().processed_since_restart, 2);
    }

    #[tokio::test]
    async fn test_threshold_drain_waits_for_other_slots() {
        let (pool, supervisor) = started(config(1, 3).with_thresholds(3, 100)).await;
        let mut events = pool.subscribe();

        let first = pool.try_acquire().unwrap();
        let mut second = pool.try_acquire().unwrap();
        assert!(!pool.threshold_check(&mut second));
        let mut third = pool.try_acquire().unwrap();
        assert!(pool.threshold_check(&mut third));
        assert!(third.owns_drain());

        assert_eq!(pool.worker(0).unwrap().state, WorkerState::Draining);
        assert!(pool.try_acquire().is_none());

        let restart = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.recycle(third).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!restart.is_finished());
        assert_eq!(pool.worker(0).unwrap().state, WorkerState::Draining);

        drop(first);
        drop(second);
        assert!(restart.await.unwrap());

        let worker = pool.worker(0).unwrap();
        assert_eq!(worker.state, WorkerState::Active);
        assert_eq!(worker.in_flight, 0);
        assert_eq!(worker.processed_since_restart, 0);
        assert_eq!(worker.restarts, 1);
        assert_eq!(supervisor.spawn_count(), 2);
        assert_eq!(supervisor.stop_count(), 1);

        assert!(matches!(
            events.recv().await.unwrap(),
            PoolEvent::Draining {
                reason: DrainReason::Threshold,
                ..
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            PoolEvent::Restarted { restarts: 1, .. }
        ));

        let next = pool.try_acquire().unwrap();
        assert_eq!(next.ordinal(), 1);
    }

    #[tokio::test]
    async fn test_second_trigger_ignored_while_draining() {
        let (pool, _) = started(config(1, 2)).await;

        let mut first = pool.try_acquire().unwrap();
        let mut second = pool.try_acquire().unwrap();

        assert!(pool.note_failure(&mut first));
        assert!(!pool.note_failure(&mut second));
        assert!(!pool.threshold_check(&mut second));
        assert!(!second.owns_drain());

        second.release();
        assert!(pool.recycle(first).await);
        assert_eq!(pool.worker(0).unwrap().restarts, 1);
    }

    #[tokio::test]
    async fn test_restart_exhaustion_marks_dead() {
        let (pool, supervisor) = started(config(2, 1)).await;
        let mut events = pool.subscribe();

        let mut lease = pool.try_acquire().unwrap();
        assert_eq!(lease.worker(), 0);
        assert!(pool.note_failure(&mut lease));

        supervisor.fail_next_spawns(2);
        supervisor.crash_next_spawns(1);
        assert!(!pool.recycle(lease).await);

        let worker = pool.worker(0).unwrap();
        assert_eq!(worker.state, WorkerState::Dead);
        assert_eq!(worker.in_flight, 0);
        assert!(pool.has_live_workers());
        assert_eq!(pool.live_workers(), 1);

        let _draining = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            PoolEvent::Dead { worker: 0, port: 8001, .. }
        ));

        // dead workers are skipped by admission
        assert_eq!(pool.try_acquire().unwrap().port(), 8002);
    }

    #[tokio::test]
    async fn test_start_recovers_worker_that_exits_during_warmup() {
        let supervisor = Arc::new(MockSupervisor::new());
        supervisor.crash_next_spawns(1);
        let pool = WorkerPool::new(config(2, 1), supervisor.clone());

        assert_eq!(pool.start().await.unwrap(), 2);
        assert_eq!(supervisor.spawn_count(), 3);
        assert!(
            pool.snapshot()
                .iter()
                .all(|w| w.state == WorkerState::Active && w.restarts == 0)
        );
    }

    #[tokio::test]
    async fn test_start_fails_without_live_workers() {
        let supervisor = Arc::new(MockSupervisor::new());
        supervisor.fail_next_spawns(10);
        let pool = WorkerPool::new(
            config(1, 1).with_restart_policy(2, Duration::from_millis(1)),
            supervisor.clone(),
        );

        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::NoLiveWorkers { workers: 1 }));
        assert_eq!(supervisor.spawn_count(), 3);
        assert!(!pool.has_live_workers());
    }

    #[tokio::test]
    async fn test_dropped_drain_owner_still_restarts_worker() {
        let (pool, _) = started(config(1, 1).with_thresholds(1, 0)).await;

        let mut lease = pool.try_acquire().unwrap();
        assert!(pool.threshold_check(&mut lease));
        drop(lease);

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let worker = pool.worker(0).unwrap();
                if worker.state == WorkerState::Active && worker.restarts == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(pool.in_flight_total(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_processes_and_admission() {
        let (pool, supervisor) = started(config(2, 1)).await;

        pool.shutdown().await;

        assert!(supervisor.running_ports().await.is_empty());
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_process_liveness_of_lease() {
        let (pool, supervisor) = started(config(2, 1)).await;

        let lease = pool.try_acquire().unwrap();
        assert!(pool.is_process_alive(&lease).await);

        supervisor.kill(8001).await;
        assert!(!pool.is_process_alive(&lease).await);
        // liveness alone does not change the worker's state
        assert_eq!(pool.worker(0).unwrap().state, WorkerState::Active);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_restart_and_stops_new_process() {
        let (pool, supervisor) = started(
            config(1, 1).with_warmup(Duration::ZERO, Duration::from_millis(100)),
        )
        .await;

        let mut lease = pool.try_acquire().unwrap();
        assert!(pool.note_failure(&mut lease));
        let restart = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.recycle(lease).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.worker(0).unwrap().state, WorkerState::Restarting);

        pool.shutdown().await;

        assert!(supervisor.running_ports().await.is_empty());
        assert_eq!(supervisor.spawn_count(), 2);
        assert_eq!(supervisor.stop_count(), 2);
        assert!(!restart.await.unwrap());
        assert_ne!(pool.worker(0).unwrap().state, WorkerState::Active);
    }
}
