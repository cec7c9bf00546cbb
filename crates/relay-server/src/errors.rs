//! Server error types.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why a WebSocket upgrade was refused before the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// `Origin` header not in the allow-list.
    #[error("forbidden origin")]
    ForbiddenOrigin,
    /// `saga_id` query parameter absent or empty.
    #[error("missing saga_id")]
    MissingSagaId,
}

impl AdmissionError {
    /// HTTP status for this refusal.
    pub fn status(self) -> StatusCode {
        match self {
            Self::ForbiddenOrigin => StatusCode::FORBIDDEN,
            Self::MissingSagaId => StatusCode::BAD_REQUEST,
        }
    }

    /// Metric label.
    pub fn reason(self) -> &'static str {
        match self {
            Self::ForbiddenOrigin => "forbidden_origin",
            Self::MissingSagaId => "missing_saga_id",
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Errors that end a connection's write loop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A single frame did not finish within the write deadline.
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    /// The transport reported an error.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}
