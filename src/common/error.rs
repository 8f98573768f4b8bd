//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

/// Synergy proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS handshake error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Malformed frame or packet
    #[error("Codec error: {0}")]
    Codec(String),

    /// Login handshake violated its protocol
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Destination resolution failed
    #[error("Location error: {0}")]
    Location(String),

    /// Proxy is already bound
    #[error("Proxy {0} is already started")]
    AlreadyStarted(String),

    /// Unknown proxy id
    #[error("Proxy {0} not found")]
    NotFound(String),

    /// Deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        match err {
            tokio_tungstenite::tungstenite::Error::Io(e) => ProxyError::Io(e),
            other => ProxyError::Codec(format!("websocket: {}", other)),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Location(err.to_string())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
