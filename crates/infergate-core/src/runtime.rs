// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for infergate-core.
//!
//! [`GatewayRuntime`] boots the worker pool, starts the dispatcher loops and
//! owns the shutdown sequence. The HTTP gateway is one user; tests and other
//! front ends can embed it directly.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use infergate_core::proxy::{HttpProxyClient, HttpProxyConfig};
//! use infergate_core::runtime::GatewayRuntime;
//! use infergate_core::supervisor::NativeSupervisor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = GatewayRuntime::builder()
//!         .supervisor(Arc::new(NativeSupervisor::from_env()?))
//!         .proxy(Arc::new(HttpProxyClient::new(HttpProxyConfig::from_env()?)?))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let rx = runtime.submit(request)?;
//!     let response = rx.await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DispatchConfig, PoolConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Error, Result};
use crate::pool::WorkerPool;
use crate::proxy::{ProxyClient, ProxyRequest};
use crate::queue::{CompletionReceiver, IngestQueue};
use crate::supervisor::Supervisor;

/// Builder for creating a [`GatewayRuntime`].
#[derive(Default)]
pub struct GatewayRuntimeBuilder {
    pool_config: PoolConfig,
    dispatch_config: DispatchConfig,
    supervisor: Option<Arc<dyn Supervisor>>,
    proxy: Option<Arc<dyn ProxyClient>>,
}

impl GatewayRuntimeBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool configuration.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the dispatcher configuration.
    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch_config = config;
        self
    }

    /// Set the process supervisor (required).
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the proxy client (required).
    pub fn proxy(mut self, proxy: Arc<dyn ProxyClient>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or a configuration
    /// value is out of range.
    pub fn build(self) -> Result<GatewayRuntimeConfig> {
        let supervisor = self
            .supervisor
            .ok_or_else(|| Error::Runtime("supervisor is required".to_string()))?;
        let proxy = self
            .proxy
            .ok_or_else(|| Error::Runtime("proxy is required".to_string()))?;
        self.pool_config.validate()?;
        self.dispatch_config.validate()?;

        Ok(GatewayRuntimeConfig {
            pool_config: self.pool_config,
            dispatch_config: self.dispatch_config,
            supervisor,
            proxy,
        })
    }
}

/// Configuration for a [`GatewayRuntime`].
pub struct GatewayRuntimeConfig {
    pool_config: PoolConfig,
    dispatch_config: DispatchConfig,
    supervisor: Arc<dyn Supervisor>,
    proxy: Arc<dyn ProxyClient>,
}

impl GatewayRuntimeConfig {
    /// Start every worker, then the dispatcher loops.
    ///
    /// Fails if no worker becomes live.
    pub async fn start(self) -> Result<GatewayRuntime> {
        let pool = WorkerPool::new(self.pool_config, self.supervisor);
        if let Err(e) = pool.start().await {
            pool.shutdown().await;
            return Err(e.into());
        }

        let queue = Arc::new(IngestQueue::new(self.dispatch_config.max_queue_depth));
        let shutdown_grace = self.dispatch_config.shutdown_grace;
        let dispatcher = Dispatcher::new(
            queue.clone(),
            pool.clone(),
            self.proxy,
            self.dispatch_config,
        );

        let cancel = CancellationToken::new();
        let loops = dispatcher.spawn_loops(cancel.clone());
        info!(loops = loops.len(), "Gateway runtime started");

        Ok(GatewayRuntime {
            queue,
            pool,
            dispatcher,
            cancel,
            loops,
            shutdown_grace,
        })
    }
}

/// Running pool plus dispatcher loops.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GatewayRuntime {
    queue: Arc<IngestQueue>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    shutdown_grace: std::time::Duration,
}

impl GatewayRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder::new()
    }

    /// Enqueue a request. Await the receiver for its outcome.
    pub fn submit(
        &self,
        request: ProxyRequest,
    ) -> std::result::Result<CompletionReceiver, DispatchError> {
        self.queue.submit(request)
    }

    /// The ingest queue.
    pub fn queue(&self) -> &Arc<IngestQueue> {
        &self.queue
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Check if every dispatcher loop is still running.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.loops.iter().all(|h| !h.is_finished())
    }

    /// Gracefully shut down.
    ///
    /// Stops the dispatcher loops, resolves queued requests with
    /// `ShuttingDown`, waits up to the grace period for in-flight calls and
    /// stops every worker process.
    pub async fn shutdown(self) -> Result<()> {
        info!("Gateway runtime shutting down...");

        self.cancel.cancel();
        let mut panicked = 0usize;
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!("Dispatcher loop panicked: {}", e);
                panicked += 1;
            }
        }

        let rejected = self.queue.close();
        if rejected > 0 {
            info!(rejected = rejected, "Rejected queued requests");
        }

        let tracker = self.dispatcher.tracker();
        tracker.close();
        if tokio::time::timeout(self.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.pool.in_flight_total(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Grace period elapsed with calls still in flight"
            );
        }

        self.pool.shutdown().await;

        if panicked > 0 {
            return Err(Error::Runtime(format!(
                "{panicked} dispatcher loop(s) panicked"
            )));
        }
        info!("Gateway runtime shutdown complete");
        Ok(())
    }
}
