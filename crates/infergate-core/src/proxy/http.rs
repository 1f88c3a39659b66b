// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP proxy client backed by reqwest.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{trace, warn};

use crate::config::{ConfigError, parse_var};

use super::traits::{
    ProxyClient, ProxyRequest, TransportError, UpstreamResponse, forwardable_headers,
    is_hop_by_hop,
};

/// HTTP proxy configuration.
#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    /// Host the workers listen on.
    pub host: String,
    /// Path of the worker endpoint.
    pub path: String,
    /// Timeout for one proxied call, body included.
    pub request_timeout: Duration,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for HttpProxyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            path: "/api/tr-run/".to_string(),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl HttpProxyConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("INFERGATE_UPSTREAM_HOST").unwrap_or(defaults.host),
            path: lookup("INFERGATE_UPSTREAM_PATH").unwrap_or(defaults.path),
            request_timeout: Duration::from_secs(parse_var(
                &lookup,
                "INFERGATE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(parse_var(
                &lookup,
                "INFERGATE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
        })
    }

    /// Set the worker host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the proxied call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Proxy client that forwards over HTTP to `http://{host}:{port}{path}`.
pub struct HttpProxyClient {
    client: reqwest::Client,
    config: HttpProxyConfig,
}

impl HttpProxyClient {
    /// Create a new HTTP proxy client.
    pub fn new(config: HttpProxyConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    /// Worker endpoint URL for `port`.
    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.config.host, port, self.config.path)
    }
}

/// Map a reqwest failure onto the transport taxonomy.
fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else if error.is_request() || error.is_body() || error.is_decode() {
        TransportError::Disconnected(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

#[async_trait]
impl ProxyClient for HttpProxyClient {
    fn client_type(&self) -> &'static str {
        "http"
    }

    async fn forward(
        &self,
        request: &ProxyRequest,
        port: u16,
    ) -> Result<UpstreamResponse, TransportError> {
        let url = self.url(port);
        trace!(url = %url, body_bytes = request.body.len(), "Forwarding request");

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(forwardable_headers(&request.headers))
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                let err = classify(e);
                warn!(port = port, error = %err, "Proxied call failed");
                err
            })?;

        let status = response.status().as_u16();
        let mut headers = response.headers().clone();
        let hop_by_hop: Vec<_> = headers
            .keys()
            .filter(|name| is_hop_by_hop(name))
            .cloned()
            .collect();
        for name in hop_by_hop {
            headers.remove(name);
        }

        let body = response.bytes().await.map_err(|e| {
            let err = classify(e);
            warn!(port = port, status = status, error = %err, "Failed to read worker response body");
            err
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
