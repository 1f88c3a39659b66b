// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infergate Core - Admission Control and Worker Recycling
//!
//! This crate load-balances opaque inference requests across a fixed pool of
//! local worker processes. It caps concurrent requests per worker, recycles
//! a worker before it processes enough requests to risk exhausting GPU
//! memory, and recovers a worker that crashes mid-request.
//!
//! # Architecture
//!
//! ```text
//!   Gateway ──submit──▶ IngestQueue ──pop──▶ Dispatcher ──try_acquire──▶ WorkerPool
//!      ▲                                         │                           │
//!      │ CompletionHandle                        │ forward                   │ spawn / stop
//!      │                                         ▼                           ▼
//!      └──────────────── resolve ─────────── ProxyClient ──HTTP──▶  worker :8001..800N
//! ```
//!
//! # Worker State Machine
//!
//! ```text
//!   Active ──(threshold | crash status)──▶ Draining ──(owner slot only)──▶ Restarting
//!     ▲                                                                      │    │
//!     └───────────────────────(spawn + warm-up ok)───────────────────────────┘    │
//!                                                           (attempts exhausted)  ▼
//!                                                                               Dead
//! ```
//!
//! # Modules
//!
//! - [`supervisor`]: Worker process lifecycle (spawn, stop, liveness)
//! - [`proxy`]: Forwarding a request to one worker
//! - [`queue`]: Bounded ingest queue and completion handles
//! - [`pool`]: Worker records, admission and the restart procedure
//! - [`dispatcher`]: Loops that place queued requests on workers
//! - [`events`]: Lifecycle events for operators
//! - [`config`]: Pool and dispatcher configuration
//! - [`error`]: Error taxonomy and the client error envelope
//! - [`runtime`]: Embeddable runtime tying everything together

#![deny(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod runtime;
pub mod supervisor;

pub use config::{ConfigError, DispatchConfig, PoolConfig};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Error, ErrorEnvelope, PoolError, Result};
pub use events::PoolEvent;
pub use pool::{DrainReason, WorkerId, WorkerLease, WorkerPool, WorkerSnapshot, WorkerState};
pub use proxy::{ProxyClient, ProxyRequest, TransportError, UpstreamResponse};
pub use queue::{CompletionHandle, CompletionReceiver, DispatchResult, IngestQueue, PendingRequest};
pub use runtime::{GatewayRuntime, GatewayRuntimeBuilder};
pub use supervisor::{ProcessHandle, Supervisor, SupervisorError};
