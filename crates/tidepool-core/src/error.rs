//! Error types for Tidepool

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a `ConnectionFactory` while opening a connection
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The server could not be reached right now; retrying may succeed
    #[error("Transient connection failure: {0}")]
    Transient(String),

    /// The server rejected the connection (bad credentials, unknown database, ...)
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Whether the pool should retry the open after a backoff delay.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectError::Transient(_) => true,
            ConnectError::Io(_) => true,
            ConnectError::Refused(_) => false,
        }
    }
}

/// Core error type for pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool exhausted: no connection became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Factory error: {0}")]
    Factory(#[from] ConnectError),

    #[error("Invalid slot: {0}")]
    InvalidSlot(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl PoolError {
    /// Whether the caller may reasonably retry the operation later.
    ///
    /// Capacity exhaustion and transient connect failures are recoverable;
    /// shutdown and configuration errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PoolError::PoolExhausted(_) => true,
            PoolError::Factory(err) => err.is_transient(),
            PoolError::InvalidSlot(_) => true,
            _ => false,
        }
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(err: toml::de::Error) -> Self {
        PoolError::Configuration(err.to_string())
    }
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;
