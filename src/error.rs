//! # Error Handling
//!
//! Error types for every layer of the relay, from a single audio frame up to
//! the HTTP surface.
//!
//! ## Error Taxonomy:
//! - **TranscodeError**: frame level. One frame is dropped, the call goes on.
//! - **ModelError**: anything that goes wrong talking to the model endpoint
//!   (handshake, socket, wire format).
//! - **RelayError**: what a [`RelaySession`](crate::relay::RelaySession)
//!   reports to its caller. Only connection/transport failures are fatal.
//! - **AppError**: HTTP-facing errors, rendered as JSON bodies.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::relay::SessionState;

/// Failure converting one audio frame between telephone and model formats.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranscodeError {
    /// Linear PCM frames carry 2 bytes per sample, so the length must be even.
    #[error("linear PCM frame has odd length {0}")]
    OddLength(usize),

    /// Model audio arrived at a rate the outbound pipeline cannot decimate.
    #[error("unsupported sample rate {actual} Hz (expected {expected} Hz)")]
    UnsupportedRate { expected: u32, actual: u32 },
}

/// Errors raised while connecting to or talking with the model endpoint.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model API key is not configured")]
    MissingApiKey,

    #[error("model handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("model connection closed before setup completed")]
    ClosedDuringHandshake,

    #[error("model connection is closed")]
    LinkClosed,

    #[error("malformed model message: {0}")]
    Malformed(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay session is closed")]
    Closed,

    #[error("relay session is not streaming (state: {0})")]
    NotStreaming(SessionState),

    #[error("failed to connect to model: {0}")]
    Connect(#[source] ModelError),

    #[error("model transport failed: {0}")]
    Transport(#[source] ModelError),

    #[error("frame dropped: {0}")]
    Frame(#[from] TranscodeError),

    #[error("relay session '{0}' already exists")]
    DuplicateSession(String),

    #[error("maximum concurrent calls ({0}) reached")]
    CapacityReached(usize),
}

impl RelayError {
    /// Whether this error ended (or prevented) the session.
    ///
    /// Frame-level errors are never fatal; the caller drops the frame and
    /// keeps feeding audio.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Closed | RelayError::Connect(_) | RelayError::Transport(_)
        )
    }
}

/// HTTP-facing application errors.
///
/// ## HTTP Status Code Mapping:
/// - Internal/Config → 500
/// - BadRequest/Validation → 400
/// - NotFound → 404
/// - Unavailable → 503
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    fn kind(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        }
    }
}

/// Renders every error as:
/// ```json
/// { "error": { "type": "validation_error", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.kind();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::CapacityReached(_) => AppError::Unavailable(err.to_string()),
            RelayError::DuplicateSession(_) => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
