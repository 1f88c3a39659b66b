// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infergate Server - HTTP gateway for a pool of inference workers
//!
//! Accepts `POST /api/tr-run` from clients, hands every request to the
//! [`infergate_core`] ingest queue and relays the worker's answer.
//!
//! ```text
//!   client ──POST /api/tr-run──► axum router ──submit──► IngestQueue
//!                                     ▲                      │
//!                                     │ completion           ▼
//!                                     └──────────────── Dispatcher ──► worker :8001..
//! ```
//!
//! # Endpoints
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /api/tr-run`, `POST /api/tr-run/` | Forwarded to a worker |
//! | `GET /health` | `ok` / `degraded`, 503 when no worker is live |
//! | `GET /api/workers` | Per-worker snapshots |

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::ApiError;
pub use handlers::AppState;
pub use server::{build_router, serve, shutdown_signal, spawn_event_logger};
