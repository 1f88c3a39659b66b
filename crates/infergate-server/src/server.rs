// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router construction and the serve loop.

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use infergate_core::{PoolEvent, WorkerPool};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::handlers::{self, AppState};

/// Build the gateway router.
///
/// - `POST /api/tr-run` and `POST /api/tr-run/` are forwarded to a worker.
/// - `GET /health` reports live workers.
/// - `GET /api/workers` lists per-worker snapshots.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/tr-run", post(handlers::tr_run))
        .route("/api/tr-run/", post(handlers::tr_run))
        .route("/health", get(handlers::health))
        .route("/api/workers", get(handlers::workers))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` completes.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Gateway listening");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Gateway stopped accepting connections");
    Ok(())
}

/// Log pool lifecycle events until the pool's event channel closes.
pub fn spawn_event_logger(pool: &Arc<WorkerPool>) -> JoinHandle<()> {
    let mut events = pool.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Draining {
                    worker,
                    port,
                    reason,
                }) => {
                    info!(worker = worker, port = port, reason = %reason, "Worker draining");
                }
                Ok(PoolEvent::Restarted {
                    worker,
                    port,
                    restarts,
                    pid,
                }) => {
                    info!(
                        worker = worker,
                        port = port,
                        restarts = restarts,
                        pid = ?pid,
                        "Worker restarted"
                    );
                }
                Ok(PoolEvent::Dead {
                    worker,
                    port,
                    error: reason,
                }) => {
                    error!(
                        worker = worker,
                        port = port,
                        error = %reason,
                        "Worker is dead and will not be restarted"
                    );
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Pool event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
