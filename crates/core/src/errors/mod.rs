//! Error types and Result alias for the relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Exchange request failed: {method} {url} -> {status}: {body}")]
    ExchangeError {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Sizing error: {0}")]
    SizingError(String),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("chain_expired: age {age_ms}ms exceeds window {window_ms}ms")]
    ChainExpired { age_ms: u64, window_ms: u64 },

    #[error("require_flat_timeout: {0}")]
    FlatTimeout(String),

    #[error("Batch refused: {0}")]
    BatchRefused(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}
