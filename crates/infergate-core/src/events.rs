// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker lifecycle events published by the pool.
//!
//! Subscribers receive events over a `tokio::sync::broadcast` channel. A slow
//! subscriber that falls behind observes `RecvError::Lagged` and skips ahead;
//! the pool never blocks on delivery.

use serde::Serialize;

use crate::pool::{DrainReason, WorkerId};

/// A worker lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A worker stopped accepting new requests ahead of a restart.
    Draining {
        /// Worker index.
        worker: WorkerId,
        /// Worker port.
        port: u16,
        /// What triggered the drain.
        reason: DrainReason,
    },
    /// A worker came back up after a restart.
    Restarted {
        /// Worker index.
        worker: WorkerId,
        /// Worker port.
        port: u16,
        /// Restarts of this worker so far.
        restarts: u64,
        /// Process id of the new worker process, if known.
        pid: Option<u32>,
    },
    /// A worker exhausted its restart attempts and is permanently excluded.
    Dead {
        /// Worker index.
        worker: WorkerId,
        /// Worker port.
        port: u16,
        /// Last spawn error.
        error: String,
    },
}

impl PoolEvent {
    /// Index of the worker the event is about.
    pub fn worker(&self) -> WorkerId {
        match self {
            PoolEvent::Draining { worker, .. }
            | PoolEvent::Restarted { worker, .. }
            | PoolEvent::Dead { worker, .. } => *worker,
        }
    }
}
