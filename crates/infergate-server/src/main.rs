// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infergate - inference gateway server
//!
//! Boots the worker pool, starts the dispatcher loops and serves the HTTP
//! gateway until Ctrl-C or SIGTERM.

use std::sync::Arc;
use tracing::{info, warn};

use infergate_core::GatewayRuntime;
use infergate_core::proxy::HttpProxyClient;
use infergate_core::supervisor::NativeSupervisor;
use infergate_server::{AppState, Config, build_router, serve, shutdown_signal, spawn_event_logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "infergate_server=info,infergate_core=info,tower_http=info".into()
            }),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        workers = config.pool.worker_count,
        base_port = config.pool.base_port,
        max_in_flight = config.pool.max_in_flight,
        program = %config.supervisor.program,
        "Starting infergate"
    );

    let supervisor = Arc::new(NativeSupervisor::new(config.supervisor.clone()));
    let proxy = Arc::new(HttpProxyClient::new(config.proxy.clone())?);

    let runtime = GatewayRuntime::builder()
        .pool_config(config.pool.clone())
        .dispatch_config(config.dispatch.clone())
        .supervisor(supervisor)
        .proxy(proxy)
        .build()?
        .start()
        .await?;

    let events = spawn_event_logger(runtime.pool());

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            runtime.shutdown().await?;
            return Err(e.into());
        }
    };

    let router = build_router(AppState::new(&runtime), config.max_body_bytes);
    let served = serve(listener, router, shutdown_signal()).await;

    runtime.shutdown().await?;
    events.abort();
    served?;

    info!("Infergate shut down");

    Ok(())
}
