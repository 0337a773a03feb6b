//! Request-level error taxonomy.
//!
//! Every pipeline stage either writes its own response or returns an
//! [`AppError`]; the orchestrator turns the error into an error envelope using
//! [`AppError::status`] and [`AppError::public_message`].

use thiserror::Error;

use crate::http::StatusCode;

/// Message shown to clients for faults whose detail must stay server-side.
pub const REDACTED_MESSAGE: &str = "Internal server error";

/// Errors produced while processing a single request.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed client input: bad JSON, missing boundary, bad parameters.
    #[error("{0}")]
    BadRequest(String),

    #[error("request entity too large ({declared} bytes, limit {limit})")]
    PayloadTooLarge { declared: usize, limit: usize },

    #[error("{0}")]
    NotFound(String),

    /// Path traversal or other access outside an allowed root.
    #[error("{0}")]
    Forbidden(String),

    #[error("request timeout")]
    Timeout,

    /// A handler-chosen status code and message, surfaced verbatim.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// Unexpected failure. The detail is logged, never sent to the client.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Creates an error with an explicit status code and client-visible message.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// The HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BadRequest,
            Self::PayloadTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::Forbidden(_) => StatusCode::Forbidden,
            Self::Timeout => StatusCode::RequestTimeout,
            Self::Status { status, .. } => *status,
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => StatusCode::InternalServerError,
        }
    }

    /// The message placed in the error envelope.
    ///
    /// Untyped server faults are redacted to [`REDACTED_MESSAGE`].
    pub fn public_message(&self) -> String {
        match self {
            Self::PayloadTooLarge { .. } => "Request entity too large".to_owned(),
            Self::Timeout => "Request timeout".to_owned(),
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => REDACTED_MESSAGE.to_owned(),
            other => other.to_string(),
        }
    }

    /// Returns `true` when the error is a server fault rather than a client mistake.
    pub fn is_server_fault(&self) -> bool {
        self.status_code().is_server_error()
    }
}
