//! HTTP error mapping.
//!
//! Handlers return [`AppError`]; the mapping to status codes is fixed
//! here. Internal detail is logged, never sent — peers and clients see
//! the status line and a terse message only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use pex_files::ReadError;

/// Application-level error, mapped onto a response at the edge.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed range or unparseable path (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Content unavailable here, or peer resolution timed out (404).
    #[error("not found")]
    NotFound,

    /// The mirror consumed its retry budget without an answer (500).
    #[error("peer resolution exhausted")]
    Exhausted,

    /// Everything else (500). The message is logged, not returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            Self::Exhausted => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "peer resolution exhausted",
            )
                .into_response(),
            Self::Internal(message) => {
                error!(%message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

impl From<ReadError> for AppError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::NotFound => Self::NotFound,
            // A peer asked outside its committed chunk; it gets a plain
            // miss, never an explanation.
            ReadError::SingleChunkOnly { .. } => Self::NotFound,
            ReadError::Range(e) => Self::BadRequest(e.to_string()),
            ReadError::Digest(e) => Self::BadRequest(e.to_string()),
            ReadError::Key(e) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
