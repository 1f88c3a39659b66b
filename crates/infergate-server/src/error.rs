// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API error handling.
//!
//! Every failure reaching the caller is rendered as the `{code, msg}`
//! envelope with the matching HTTP status.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use infergate_core::{DispatchError, ErrorEnvelope};
use tokio::sync::oneshot::error::RecvError;

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Envelope written as the JSON body.
    pub envelope: ErrorEnvelope,
}

impl ApiError {
    /// Build an error with an arbitrary status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope {
                code: status.as_u16(),
                msg: msg.into(),
            },
        }
    }

    /// 500 Internal Server Error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let envelope = err.envelope();
        let status =
            StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self { status, envelope }
    }
}

impl From<RecvError> for ApiError {
    /// The completion handle was dropped without an outcome.
    fn from(_: RecvError) -> Self {
        Self::internal("Request was dropped before completion")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergate_core::proxy::TransportError;

    #[test]
    fn test_dispatch_error_statuses() {
        let cases = [
            (
                DispatchError::Transport(TransportError::Connect("refused".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                DispatchError::Transport(TransportError::Disconnected("reset".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                DispatchError::RetriesExhausted {
                    attempts: 2,
                    status: 500,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                DispatchError::QueueFull { depth: 8 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (DispatchError::NoWorkers, StatusCode::SERVICE_UNAVAILABLE),
            (DispatchError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (err, status) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.envelope.code, status.as_u16());
        }
    }

    #[test]
    fn test_into_response_uses_status() {
        let response = ApiError::from(DispatchError::NoWorkers).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
