//! Error handling for the sync engine and the record backend.
//!
//! One error type is shared by the client-side sync layer and the HTTP
//! backend so that a rejection raised by the store survives the trip over
//! the wire with its code intact.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const CONNECTIVITY_ERROR: &str = "CONNECTIVITY_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// Errors raised anywhere in the sync stack.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Authentication required or rejected
    Unauthorized(String),
    /// Record missing or not owned by the caller
    NotFound(String),
    /// Payload does not match its table's shape
    Validation(String),
    /// Optimistic concurrency conflict
    Conflict {
        message: String,
        current_version: i64,
    },
    /// Remote store database failure
    Database(String),
    /// Local durable storage failure
    Storage(String),
    /// The remote store could not be reached
    Connectivity(String),
    /// A bounded wait elapsed
    Timeout(String),
    /// Internal error
    Internal(String),
    /// Malformed request
    BadRequest(String),
}

impl SyncError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::Conflict { .. } => StatusCode::CONFLICT,
            SyncError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::Connectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Unauthorized(_) => codes::UNAUTHORIZED,
            SyncError::NotFound(_) => codes::NOT_FOUND,
            SyncError::Validation(_) => codes::VALIDATION_ERROR,
            SyncError::Conflict { .. } => codes::VERSION_MISMATCH,
            SyncError::Database(_) => codes::DATABASE_ERROR,
            SyncError::Storage(_) => codes::STORAGE_ERROR,
            SyncError::Connectivity(_) => codes::CONNECTIVITY_ERROR,
            SyncError::Timeout(_) => codes::TIMEOUT,
            SyncError::Internal(_) => codes::INTERNAL_ERROR,
            SyncError::BadRequest(_) => codes::BAD_REQUEST,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            SyncError::Unauthorized(msg)
            | SyncError::NotFound(msg)
            | SyncError::Validation(msg)
            | SyncError::Database(msg)
            | SyncError::Storage(msg)
            | SyncError::Connectivity(msg)
            | SyncError::Timeout(msg)
            | SyncError::Internal(msg)
            | SyncError::BadRequest(msg) => msg.clone(),
            SyncError::Conflict { message, .. } => message.clone(),
        }
    }

    /// Whether retrying the same request later may succeed without changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connectivity(_) | SyncError::Timeout(_))
    }

    /// Rebuild an error from the envelope returned by the HTTP backend.
    pub fn from_details(details: &ErrorDetails) -> Self {
        let message = details.message.clone();
        match details.code.as_str() {
            codes::UNAUTHORIZED => SyncError::Unauthorized(message),
            codes::NOT_FOUND => SyncError::NotFound(message),
            codes::VALIDATION_ERROR => SyncError::Validation(message),
            codes::VERSION_MISMATCH => SyncError::Conflict {
                message,
                current_version: details
                    .details
                    .as_ref()
                    .and_then(|d| d.get("currentVersion"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
            },
            codes::DATABASE_ERROR => SyncError::Database(message),
            codes::STORAGE_ERROR => SyncError::Storage(message),
            codes::CONNECTIVITY_ERROR => SyncError::Connectivity(message),
            codes::TIMEOUT => SyncError::Timeout(message),
            codes::BAD_REQUEST => SyncError::BadRequest(message),
            _ => SyncError::Internal(message),
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for SyncError {}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        SyncError::Database(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Validation(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(format!("I/O error: {}", err))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            SyncError::Connectivity(format!("Remote unreachable: {}", err))
        } else if err.is_decode() {
            SyncError::BadRequest(format!("Malformed response: {}", err))
        } else {
            SyncError::Internal(format!("HTTP error: {}", err))
        }
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
}

impl ErrorResponse {
    pub fn new(error: &SyncError) -> Self {
        let details = match error {
            SyncError::Conflict {
                current_version, ..
            } => Some(serde_json::json!({ "currentVersion": current_version })),
            _ => None,
        };

        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
                details,
            },
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(&self);
        (status, Json(body)).into_response()
    }
}
