// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher loops.
//!
//! A loop takes the request at the front of the [`IngestQueue`], reserves a
//! worker slot, and hands the proxied call to its own task so the next
//! request can be placed while it runs. When no worker has a free slot the
//! request goes back to the front and the loop sleeps until a slot frees up
//! or the recheck interval elapses.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::pool::{WorkerLease, WorkerPool};
use crate::proxy::{ProxyClient, TransportError};
use crate::queue::{IngestQueue, PendingRequest};

/// Routes queued requests to workers.
pub struct Dispatcher {
    queue: Arc<IngestQueue>,
    pool: Arc<WorkerPool>,
    proxy: Arc<dyn ProxyClient>,
    config: DispatchConfig,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Create a dispatcher over a queue, a pool and a proxy client.
    pub fn new(
        queue: Arc<IngestQueue>,
        pool: Arc<WorkerPool>,
        proxy: Arc<dyn ProxyClient>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            pool,
            proxy,
            config,
            tracker: TaskTracker::new(),
        })
    }

    /// Tracker of in-flight proxied calls.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Spawn `dispatcher_loops` loops that run until `cancel` fires or the
    /// queue is closed.
    pub fn spawn_loops(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.dispatcher_loops)
            .map(|loop_id| {
                let this = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { this.run(loop_id, cancel).await })
            })
            .collect()
    }

    /// Run one dispatcher loop.
    pub async fn run(self: Arc<Self>, loop_id: usize, cancel: CancellationToken) {
        info!(
            loop_id = loop_id,
            proxy = self.proxy.client_type(),
            "Dispatcher loop started"
        );

        loop {
            let pending = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                next = self.queue.pop() => match next {
                    Some(pending) => pending,
                    None => break,
                },
            };

            if pending.is_cancelled() {
                debug!(request_id = pending.id, "Discarding request whose caller went away");
                continue;
            }

            let capacity = self.pool.capacity_changed();
            tokio::pin!(capacity);
            capacity.as_mut().enable();

            match self.pool.try_acquire() {
                Some(mut lease) => {
                    if !pending.triggered_restart {
                        self.pool.threshold_check(&mut lease);
                    }
                    debug!(
                        request_id = pending.id,
                        worker = lease.worker(),
                        port = lease.port(),
                        ordinal = lease.ordinal(),
                        queued_ms = pending.enqueued_at.elapsed().as_millis() as u64,
                        "Request assigned"
                    );
                    let this = Arc::clone(&self);
                    self.tracker.spawn(async move { this.serve(lease, pending).await });
                }
                None if !self.pool.has_live_workers() => {
                    warn!(request_id = pending.id, "No live workers, rejecting request");
                    pending.resolve(Err(DispatchError::NoWorkers));
                }
                None => {
                    trace!(request_id = pending.id, "All workers busy, requeueing");
                    self.queue.requeue(pending);

                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => break,
                        _ = &mut capacity => {}
                        _ = tokio::time::sleep(self.config.recheck_interval) => {}
                    }
                }
            }
        }

        info!(loop_id = loop_id, "Dispatcher loop stopped");
    }

    /// Carry one assigned request to completion.
    async fn serve(self: Arc<Self>, mut lease: WorkerLease, mut pending: PendingRequest) {
        if lease.owns_drain() {
            // The assignment that crossed the threshold drives the restart;
            // its request is placed again once the worker is back.
            pending.triggered_restart = true;
            self.pool.recycle(lease).await;
            self.queue.requeue(pending);
            return;
        }

        let port = lease.port();
        match self.proxy.forward(&pending.request, port).await {
            Ok(response)
                if self.config.crash_restart && response.status == self.config.crash_status =>
            {
                pending.attempts += 1;
                warn!(
                    request_id = pending.id,
                    worker = lease.worker(),
                    port = port,
                    status = response.status,
                    attempt = pending.attempts,
                    "Worker reported a backend failure"
                );

                if self.pool.note_failure(&mut lease) {
                    self.pool.recycle(lease).await;
                } else {
                    lease.release();
                }

                if pending.attempts <= self.config.max_retries {
                    self.queue.requeue(pending);
                } else {
                    let attempts = pending.attempts;
                    pending.resolve(Err(DispatchError::RetriesExhausted {
                        attempts,
                        status: response.status,
                    }));
                }
            }
            Ok(response) => {
                lease.release();
                trace!(
                    request_id = pending.id,
                    port = port,
                    status = response.status,
                    "Request completed"
                );
                pending.resolve(Ok(response));
            }
            Err(e) => {
                warn!(request_id = pending.id, port = port, error = %e, "Proxied call failed");

                // a connection failure alone never restarts a worker, a dead
                // process behind it does
                let process_gone = matches!(
                    e,
                    TransportError::Connect(_) | TransportError::Disconnected(_)
                ) && !self.pool.is_process_alive(&lease).await;

                pending.resolve(Err(DispatchError::Transport(e)));

                if process_gone && self.pool.note_failure(&mut lease) {
                    warn!(
                        worker = lease.worker(),
                        port = port,
                        "Worker process is gone, restarting"
                    );
                    self.pool.recycle(lease).await;
                } else {
                    lease.release();
                }
            }
        }
    }
}
