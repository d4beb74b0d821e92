//! Error types for the clearing protocol

use thiserror::Error;

/// Result type for clearing protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Clearing protocol errors
#[derive(Error, Debug)]
pub enum Error {
    /// The network rejected the handshake (fatal for the batch)
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The duplex connection failed (fatal for the batch)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Amount could not be parsed or converted
    #[error("Amount error: {0}")]
    Amount(String),

    /// Key or signature error
    #[error("Signature error: {0}")]
    Signature(String),

    /// Message arrived in a state that cannot accept it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Wire encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error ends the whole batch rather than a single instruction
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::Connection(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_fatal_kinds() {
        assert!(Error::Authentication("bad signature".to_string()).is_batch_fatal());
        assert!(Error::Connection("reset".to_string()).is_batch_fatal());
        assert!(!Error::InvalidState("transfer before auth".to_string()).is_batch_fatal());
        assert!(!Error::Amount("negative".to_string()).is_batch_fatal());
    }
}
