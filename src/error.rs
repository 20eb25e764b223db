//! WolfStream Error Types

use thiserror::Error;

/// Result type alias for WolfStream operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfStream error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // WAL errors
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("WAL read error: {0}")]
    WalRead(String),

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Replication errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Following canceled")]
    Canceled,
}

impl Error {
    /// Check if this error is the cancellation sentinel
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Check if this error is worth retrying after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::WalRead(_) | Error::Io(_))
    }
}
