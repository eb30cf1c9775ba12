//! Partyline Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Partyline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Partyline error types
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (raised before any store access)
    #[error("Invalid connectionId format: {0}")]
    InvalidConnectionIdFormat(String),

    #[error("Invalid sessionId format: {0}")]
    InvalidSessionIdFormat(String),

    #[error("Invalid instanceId format: {0}")]
    InvalidInstanceIdFormat(String),

    #[error("Connection not registered: {0}")]
    ConnectionNotFound(String),

    // Store errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Store command failed: {0}")]
    StoreCommand(String),

    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("No async runtime available: {0}")]
    Runtime(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Error::StoreUnavailable(err.to_string())
        } else {
            Error::StoreCommand(err.to_string())
        }
    }
}

impl Error {
    /// Check if this error is transient and the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::StoreTimeout(_))
    }

    /// Check if this error is a caller-side id validation failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidConnectionIdFormat(_)
                | Error::InvalidSessionIdFormat(_)
                | Error::InvalidInstanceIdFormat(_)
        )
    }
}
