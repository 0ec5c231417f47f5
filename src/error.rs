//! Error types for the Quotaguard service.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Quotaguard operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the Redis client or server
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A backend call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A driver was used before `init` completed
    #[error("{0} backend is not initialized")]
    NotInitialized(&'static str),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
