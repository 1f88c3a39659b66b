// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxy client trait definitions.
//!
//! The payload is opaque here: a request is a method, a header map and a
//! body, and a response is a status, a header map and a body.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{self, HeaderMap, HeaderName};
use thiserror::Error;

/// Transport-level failures while talking to a worker.
///
/// These never trigger a worker restart on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Connection refused or could not be established.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Connection reset or closed before a full response arrived.
    #[error("Worker disconnected: {0}")]
    Disconnected(String),

    /// The proxied call exceeded its timeout.
    #[error("Proxied call timed out")]
    Timeout,

    /// Other client-side failure.
    #[error("Proxy error: {0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status reported to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            TransportError::Connect(_) => 400,
            TransportError::Disconnected(_) | TransportError::Timeout | TransportError::Other(_) => {
                500
            }
        }
    }
}

/// Opaque request forwarded to a worker.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// HTTP method of the inbound request.
    pub method: Method,
    /// Inbound headers as received.
    pub headers: HeaderMap,
    /// Inbound body bytes.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Create a POST request with the given headers and body.
    pub fn post(headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            headers,
            body: body.into(),
        }
    }
}

/// Response returned by a worker.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, hop-by-hop headers removed.
    pub headers: HeaderMap,
    /// Response body bytes.
    pub body: Bytes,
}

/// Trait for forwarding a request to the worker listening on a local port.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Client type identifier (e.g., "http", "mock").
    fn client_type(&self) -> &'static str;

    /// Forward `request` to the worker on `port` and wait for its response.
    async fn forward(
        &self,
        request: &ProxyRequest,
        port: u16,
    ) -> std::result::Result<UpstreamResponse, TransportError>;
}

/// Whether a header is connection-scoped and must not be forwarded.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
        || name == header::TE
        || name == header::TRAILER
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// Copy `headers` without `Host` and hop-by-hop headers.
///
/// Everything else, cookies included, passes through verbatim.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name == header::HOST || is_hop_by_hop(name) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}
