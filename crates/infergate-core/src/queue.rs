// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingest queue and completion handles.
//!
//! Requests wait here, in arrival order, until a dispatcher loop finds them a
//! worker. A request the dispatcher could not place goes back to the front so
//! it keeps its position.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::error::DispatchError;
use crate::proxy::{ProxyRequest, UpstreamResponse};

/// Final outcome of one request.
pub type DispatchResult = Result<UpstreamResponse, DispatchError>;

/// Receiving side of a completion handle, held by the gateway.
pub type CompletionReceiver = oneshot::Receiver<DispatchResult>;

/// Single-assignment result slot for one request.
///
/// `resolve` consumes the handle, so a request resolves at most once.
/// Dropping the receiver marks the handle as cancelled.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<DispatchResult>,
}

impl CompletionHandle {
    /// Create a handle and its receiver.
    pub fn channel() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the result. Returns `false` if the caller already went away.
    pub fn resolve(self, result: DispatchResult) -> bool {
        self.tx.send(result).is_ok()
    }

    /// Whether the caller stopped waiting for the result.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A request waiting for, or holding, a worker.
#[derive(Debug)]
pub struct PendingRequest {
    /// Sequence number in arrival order.
    pub id: u64,
    /// The opaque request to forward.
    pub request: ProxyRequest,
    /// When the request entered the queue.
    pub enqueued_at: Instant,
    /// Dispatches that ended in a backend failure.
    pub attempts: u32,
    /// Set once this request has driven a threshold restart.
    pub(crate) triggered_restart: bool,
    completion: CompletionHandle,
}

impl PendingRequest {
    /// Wrap a request with its completion handle.
    pub fn new(id: u64, request: ProxyRequest, completion: CompletionHandle) -> Self {
        Self {
            id,
            request,
            enqueued_at: Instant::now(),
            attempts: 0,
            triggered_restart: false,
            completion,
        }
    }

    /// Whether the caller stopped waiting for the result.
    pub fn is_cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Resolve the request, consuming it.
    pub fn resolve(self, result: DispatchResult) -> bool {
        let delivered = self.completion.resolve(result);
        if !delivered {
            debug!(request_id = self.id, "Caller went away before the result arrived");
        }
        delivered
    }
}

struct QueueState {
    items: VecDeque<PendingRequest>,
    closed: bool,
}

/// Bounded FIFO of pending requests.
pub struct IngestQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_depth: usize,
    next_id: AtomicU64,
}

impl IngestQueue {
    /// Create a queue that rejects submissions beyond `max_depth`.
    pub fn new(max_depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            max_depth,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a new request at the back.
    ///
    /// Returns the receiver the caller awaits, or `QueueFull` / `ShuttingDown`
    /// when the request is not admitted.
    pub fn submit(&self, request: ProxyRequest) -> Result<CompletionReceiver, DispatchError> {
        let (completion, rx) = CompletionHandle::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.lock();
            if state.closed {
                return Err(DispatchError::ShuttingDown);
            }
            if state.items.len() >= self.max_depth {
                return Err(DispatchError::QueueFull {
                    depth: self.max_depth,
                });
            }
            state
                .items
                .push_back(PendingRequest::new(id, request, completion));
        }
        self.notify.notify_one();
        Ok(rx)
    }

    /// Put a request back at the front.
    ///
    /// Requeueing ignores the depth bound: the request was already admitted.
    /// On a closed queue the request is resolved with `ShuttingDown`.
    pub fn requeue(&self, pending: PendingRequest) {
        let rejected = {
            let mut state = self.lock();
            if state.closed {
                Some(pending)
            } else {
                state.items.push_front(pending);
                None
            }
        };
        match rejected {
            Some(pending) => {
                pending.resolve(Err(DispatchError::ShuttingDown));
            }
            None => self.notify.notify_one(),
        }
    }

    /// Take the request at the front, if any.
    pub fn pop_front(&self) -> Option<PendingRequest> {
        self.lock().items.pop_front()
    }

    /// Wait for a request.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<PendingRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(pending) = state.items.pop_front() {
                    return Some(pending);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop admitting requests and resolve everything still queued with
    /// `ShuttingDown`. Returns how many requests were resolved.
    pub fn close(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        let count = drained.len();
        for pending in drained {
            pending.resolve(Err(DispatchError::ShuttingDown));
        }
        self.notify.notify_waiters();
        count
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether no request is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(body: &'static str) -> ProxyRequest {
        ProxyRequest::post(HeaderMap::new(), Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_fifo_order_and_front_requeue() {
        let queue = IngestQueue::new(8);
        let _a = queue.submit(request("a")).unwrap();
        let _b = queue.submit(request("b")).unwrap();
        let _c = queue.submit(request("c")).unwrap();

        let first = queue.pop_front().unwrap();
        assert_eq!(&first.request.body[..], b"a");

        queue.requeue(first);
        let ids: Vec<u64> = std::iter::from_fn(|| queue.pop_front())
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_depth_bound() {
        let queue = IngestQueue::new(2);
        let _a = queue.submit(request("a")).unwrap();
        let _b = queue.submit(request("b")).unwrap();

        let err = queue.submit(request("c")).unwrap_err();
        assert_eq!(err, DispatchError::QueueFull { depth: 2 });
        assert_eq!(queue.len(), 2);

        // requeue bypasses the bound
        let front = queue.pop_front().unwrap();
        let _d = queue.submit(request("d")).unwrap();
        queue.requeue(front);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_cancellation_visible_to_dispatcher() {
        let queue = IngestQueue::new(4);
        let rx = queue.submit(request("a")).unwrap();
        drop(rx);

        let pending = queue.pop_front().unwrap();
        assert!(pending.is_cancelled());
        assert!(!pending.resolve(Err(DispatchError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_close_resolves_pending() {
        let queue = IngestQueue::new(4);
        let rx1 = queue.submit(request("a")).unwrap();
        let rx2 = queue.submit(request("b")).unwrap();

        assert_eq!(queue.close(), 2);
        assert_eq!(rx1.await.unwrap().unwrap_err(), DispatchError::ShuttingDown);
        assert_eq!(rx2.await.unwrap().unwrap_err(), DispatchError::ShuttingDown);

        assert_eq!(
            queue.submit(request("c")).unwrap_err(),
            DispatchError::ShuttingDown
        );
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_after_close_resolves() {
        let queue = IngestQueue::new(4);
        let rx = queue.submit(request("a")).unwrap();
        let pending = queue.pop_front().unwrap();

        queue.close();
        queue.requeue(pending);

        assert_eq!(rx.await.unwrap().unwrap_err(), DispatchError::ShuttingDown);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_submit() {
        let queue = Arc::new(IngestQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|p| p.id) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _rx = queue.submit(request("a")).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, Some(1));
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_close() {
        let queue = Arc::new(IngestQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(waiter.await.unwrap());
    }
}
