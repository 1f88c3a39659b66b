// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock proxy client for testing.
//!
//! Replies are scripted per call. A gated mock holds every call until
//! permits are released, which lets tests observe in-flight accounting.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::traits::{ProxyClient, ProxyRequest, TransportError, UpstreamResponse};

/// Scripted outcome of one proxied call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Worker answered with this status and body.
    Status(u16, String),
    /// Connection refused.
    Refused,
    /// Connection reset mid-call.
    Reset,
    /// Call timed out.
    Timeout,
}

/// Mock proxy client.
pub struct MockProxy {
    replies: Mutex<VecDeque<MockReply>>,
    port_replies: Mutex<HashMap<u16, VecDeque<MockReply>>>,
    calls: Mutex<Vec<u16>>,
    gate: Option<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
    /// Simulated latency of every call.
    pub latency: Duration,
}

impl Default for MockProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProxy {
    /// Create a mock that answers every call immediately with a 200.
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            port_replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Create a mock whose calls block until [`open`](Self::open) releases them.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    /// Let `n` blocked (or future) calls proceed.
    pub fn open(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Queue a reply for the next call to any worker.
    pub fn push_reply(&self, reply: MockReply) {
        lock(&self.replies).push_back(reply);
    }

    /// Queue a reply for the next call to the worker on `port`.
    pub fn push_reply_for(&self, port: u16, reply: MockReply) {
        lock(&self.port_replies)
            .entry(port)
            .or_default()
            .push_back(reply);
    }

    /// Ports of all calls made so far, in call order.
    pub fn calls(&self) -> Vec<u16> {
        lock(&self.calls).clone()
    }

    /// Calls currently in progress.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in progress at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, port: u16) -> MockReply {
        if let Some(reply) = lock(&self.port_replies)
            .get_mut(&port)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        lock(&self.replies).pop_front().unwrap_or_else(|| {
            MockReply::Status(
                200,
                format!(
                    r#"{{"code":200,"msg":"ok","data":{{"raw_out":"port {port}","speed_time":0.0}}}}"#
                ),
            )
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Decrements the active-call counter when a call finishes or is dropped.
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyClient for MockProxy {
    fn client_type(&self) -> &'static str {
        "mock"
    }

    async fn forward(
        &self,
        _request: &ProxyRequest,
        port: u16,
    ) -> Result<UpstreamResponse, TransportError> {
        lock(&self.calls).push(port);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveCall(&self.active);

        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(TransportError::Other("mock gate closed".to_string())),
            }
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_reply(port) {
            MockReply::Status(status, body) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Ok(UpstreamResponse {
                    status,
                    headers,
                    body: Bytes::from(body),
                })
            }
            MockReply::Refused => Err(TransportError::Connect(format!(
                "connection refused (port {port})"
            ))),
            MockReply::Reset => Err(TransportError::Disconnected(format!(
                "connection reset by peer (port {port})"
            ))),
            MockReply::Timeout => Err(TransportError::Timeout),
        }
    }
}
