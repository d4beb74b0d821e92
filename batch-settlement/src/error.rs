//! Error types for batch settlement

use thiserror::Error;

/// Result type for batch settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Batch settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed submission, rejected before it enters the queue
    #[error("Validation error: {0}")]
    Validation(String),

    /// Clearing network error
    #[error("Clearing error: {0}")]
    Clearing(#[from] clearing_protocol::Error),

    /// Settlement/minting call failed or returned an unsuccessful result
    #[error("Settlement error: {0}")]
    Settlement(String),

    /// SMS notification failed
    #[error("Notification error: {0}")]
    Notification(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
