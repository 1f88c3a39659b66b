// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock supervisor for testing.
//!
//! Simulates worker processes without launching anything. Spawn failures
//! and early exits can be scripted to exercise the restart policy.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::traits::*;

/// Mock process state.
#[derive(Debug, Clone)]
struct MockProcess {
    port: u16,
    alive: bool,
    exit_code: Option<i32>,
}

/// Mock supervisor for testing.
pub struct MockSupervisor {
    processes: Mutex<HashMap<String, MockProcess>>,
    spawns: AtomicUsize,
    stops: AtomicUsize,
    /// Number of upcoming spawns that fail outright.
    fail_spawns: AtomicUsize,
    /// Number of upcoming spawns whose process exits immediately.
    crash_spawns: AtomicUsize,
}

impl Default for MockSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSupervisor {
    /// Create a new mock supervisor where every spawn succeeds.
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            spawns: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_spawns: AtomicUsize::new(0),
            crash_spawns: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` spawns fail with [`SupervisorError::SpawnFailed`].
    pub fn fail_next_spawns(&self, n: usize) {
        self.fail_spawns.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` spawns start a process that is already dead
    /// when the warm-up check runs.
    pub fn crash_next_spawns(&self, n: usize) {
        self.crash_spawns.store(n, Ordering::SeqCst);
    }

    /// Simulate the worker on `port` dying on its own.
    pub async fn kill(&self, port: u16) {
        let mut processes = self.processes.lock().await;
        for process in processes.values_mut().filter(|p| p.port == port && p.alive) {
            process.alive = false;
            process.exit_code = Some(137);
        }
    }

    /// Total spawn attempts, including failed ones.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Total stop calls.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Ports with a live simulated process, sorted.
    pub async fn running_ports(&self) -> Vec<u16> {
        let processes = self.processes.lock().await;
        let mut ports: Vec<u16> = processes
            .values()
            .filter(|p| p.alive)
            .map(|p| p.port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

/// Decrement `counter` if positive; returns true when a unit was taken.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Supervisor for MockSupervisor {
    fn supervisor_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, port: u16) -> Result<ProcessHandle> {
        let seq = self.spawns.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.fail_spawns) {
            return Err(SupervisorError::SpawnFailed(format!(
                "mock spawn failure on port {port}"
            )));
        }

        let crashed = take_one(&self.crash_spawns);
        let handle = ProcessHandle {
            handle_id: format!("mock-{port}-{seq}"),
            port,
            pid: None,
            started_at: Utc::now(),
        };

        self.processes.lock().await.insert(
            handle.handle_id.clone(),
            MockProcess {
                port,
                alive: !crashed,
                exit_code: crashed.then_some(1),
            },
        );

        Ok(handle)
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().await.remove(&handle.handle_id);
        Ok(())
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let processes = self.processes.lock().await;
        processes
            .get(&handle.handle_id)
            .map(|p| p.alive)
            .unwrap_or(false)
    }

    async fn exit_code(&self, handle: &ProcessHandle) -> Option<i32> {
        let processes = self.processes.lock().await;
        processes.get(&handle.handle_id).and_then(|p| p.exit_code)
    }
}
