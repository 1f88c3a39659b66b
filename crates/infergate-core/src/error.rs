// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for infergate-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::TransportError;

/// JSON error body returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// HTTP status code, repeated in the body.
    pub code: u16,
    /// Human-readable message.
    pub msg: String,
}

/// Terminal failure of a single dispatched request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// The proxied call failed below HTTP.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The worker kept reporting a backend failure.
    #[error("Worker failed after {attempts} attempt(s) (status {status})")]
    RetriesExhausted {
        /// Number of dispatch attempts made.
        attempts: u32,
        /// Last upstream status seen.
        status: u16,
    },

    /// The ingest queue is at its depth bound.
    #[error("Request queue is full ({depth} pending)")]
    QueueFull {
        /// Configured depth bound.
        depth: usize,
    },

    /// Every worker is permanently dead.
    #[error("No live workers available")]
    NoWorkers,

    /// The gateway is shutting down.
    #[error("Gateway is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// HTTP status reported to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::Transport(e) => e.status_code(),
            DispatchError::RetriesExhausted { .. } => 500,
            DispatchError::QueueFull { .. }
            | DispatchError::NoWorkers
            | DispatchError::ShuttingDown => 503,
        }
    }

    /// Render the client-visible envelope.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.status_code(),
            msg: self.to_string(),
        }
    }
}

/// Worker pool errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No worker came up during start-up.
    #[error("No worker became live ({workers} configured)")]
    NoLiveWorkers {
        /// Configured worker count.
        workers: usize,
    },
}

/// Top-level core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Worker pool failed.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Building the proxy client failed.
    #[error("Proxy client error: {0}")]
    Proxy(#[from] reqwest::Error),

    /// Runtime was used in the wrong lifecycle state.
    #[error("{0}")]
    Runtime(String),
}

/// Result type using core Error.
pub type Result<T> = std::result::Result<T, Error>;
