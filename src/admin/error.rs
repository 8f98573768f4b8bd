//! Admin API Error Types
//!
//! Every failure of a management request becomes an [`AdminError`], which
//! renders as an [`ErrorResponse`] with the matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::common::ProxyError;

/// Result type for admin API operations
pub type AdminResult<T> = Result<T, AdminError>;

/// Admin API error types
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Malformed body, duplicate id or invalid definition
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown proxy id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with the proxy's state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response for API endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub message: String,

    /// Optional detailed error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message, details) = match &self {
            AdminError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request".to_string(), Some(msg.clone())),
            AdminError::NotFound(msg) => (StatusCode::NOT_FOUND, "Resource not found".to_string(), Some(msg.clone())),
            AdminError::Conflict(msg) => (StatusCode::CONFLICT, "Conflict".to_string(), Some(msg.clone())),
            AdminError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO error".to_string(), Some(e.to_string())),
            AdminError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string(), Some(msg.clone()))
            }
        };

        let error_response = ErrorResponse { message, details };
        (status, Json(error_response)).into_response()
    }
}

impl From<ProxyError> for AdminError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::NotFound(_) => AdminError::NotFound(err.to_string()),
            ProxyError::AlreadyStarted(_) => AdminError::Conflict(err.to_string()),
            ProxyError::Config(_) | ProxyError::Json(_) | ProxyError::Codec(_) => AdminError::BadRequest(err.to_string()),
            ProxyError::Io(e) => AdminError::Io(e),
            other => AdminError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AdminError {
    fn from(err: serde_json::Error) -> Self {
        AdminError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ProxyError::NotFound("a".to_string()), StatusCode::NOT_FOUND),
            (ProxyError::AlreadyStarted("a".to_string()), StatusCode::CONFLICT),
            (ProxyError::Config("bad".to_string()), StatusCode::BAD_REQUEST),
            (ProxyError::Location("down".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(AdminError::from(error).into_response().status(), status);
        }
    }
}
