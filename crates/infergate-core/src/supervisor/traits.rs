// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor trait definitions.
//!
//! Defines the abstract interface for launching and stopping worker processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from supervisor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Worker executable was not found.
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    /// The OS refused to start the process.
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// Process exited during its warm-up window.
    #[error("Worker on port {port} exited during warm-up (exit code {exit_code:?})")]
    EarlyExit {
        /// Port the worker was bound to.
        port: u16,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// No process is tracked for the handle.
    #[error("No running process for port {0}")]
    NotRunning(u16),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Handle for a launched worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Unique identifier for this launch (`<kind>-<port>-<seq>`).
    pub handle_id: String,
    /// Local port the worker was told to bind.
    pub port: u16,
    /// PID of the spawned process, captured at spawn time.
    pub pid: Option<u32>,
    /// When the process was started.
    pub started_at: DateTime<Utc>,
}

/// Trait for worker process supervisors.
///
/// Supervisors only own OS processes. They know nothing about in-flight
/// requests or restart policy; the pool decides when to call them and how
/// often to retry.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Supervisor type identifier (e.g., "native", "mock").
    fn supervisor_type(&self) -> &'static str;

    /// Launch a worker bound to `port`.
    ///
    /// Returns as soon as the process exists. Warm-up and liveness checks
    /// are the caller's concern.
    async fn spawn(&self, port: u16) -> Result<ProcessHandle>;

    /// Stop a worker: graceful terminate, bounded wait, then forced kill.
    ///
    /// Stopping a handle whose process already exited is a no-op.
    async fn stop(&self, handle: &ProcessHandle) -> Result<()>;

    /// Check whether the process behind `handle` is still running.
    async fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Exit code of a process that has already exited, if known.
    async fn exit_code(&self, handle: &ProcessHandle) -> Option<i32> {
        let _ = handle;
        None
    }
}
