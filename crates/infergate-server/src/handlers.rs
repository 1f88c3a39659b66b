// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use infergate_core::{GatewayRuntime, IngestQueue, ProxyRequest, WorkerPool, WorkerSnapshot};
use serde::Serialize;
use tracing::debug;

use crate::error::ApiError;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    /// Queue new requests are submitted to.
    pub queue: Arc<IngestQueue>,
    /// Pool inspected by the status endpoints.
    pub pool: Arc<WorkerPool>,
}

impl AppState {
    /// Build handler state from a running gateway runtime.
    pub fn new(runtime: &GatewayRuntime) -> Self {
        Self {
            queue: runtime.queue().clone(),
            pool: runtime.pool().clone(),
        }
    }
}

/// Forward an inference request to a worker and relay its response.
///
/// The worker's status, headers and body are passed through unchanged.
/// Gateway-side failures are answered with the `{code, msg}` envelope.
pub async fn tr_run(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = ProxyRequest {
        method,
        headers,
        body,
    };

    let completion = state.queue.submit(request)?;
    let upstream = completion.await??;

    debug!(
        status = upstream.status,
        body_bytes = upstream.body.len(),
        "Relaying worker response"
    );

    let status = StatusCode::from_u16(upstream.status).map_err(|_| {
        ApiError::internal(format!("Worker returned invalid status {}", upstream.status))
    })?;

    let mut headers = upstream.headers;
    headers.remove(header::CONTENT_LENGTH);

    let mut response = (status, upstream.body).into_response();
    response.headers_mut().extend(headers);
    Ok(response)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` when every worker is live, `degraded` otherwise.
    pub status: &'static str,
    /// Workers not in the `Dead` state.
    pub live_workers: usize,
    /// Configured workers.
    pub workers: usize,
    /// Requests waiting in the ingest queue.
    pub queued: usize,
    /// Proxied calls currently outstanding.
    pub in_flight: usize,
}

/// Report gateway health. Answers 503 once no worker is live.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let workers = state.pool.config().worker_count;
    let live_workers = state.pool.live_workers();

    let status_code = if live_workers == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthResponse {
        status: if live_workers == workers {
            "ok"
        } else {
            "degraded"
        },
        live_workers,
        workers,
        queued: state.queue.len(),
        in_flight: state.pool.in_flight_total(),
    };

    (status_code, Json(body))
}

/// Per-worker snapshots.
pub async fn workers(State(state): State<AppState>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.pool.snapshot())
}
