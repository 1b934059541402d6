//! Error types for the Deribit client.

use thiserror::Error;

/// Result type alias for Deribit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Deribit client errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed credentials at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The exchange rejected the credentials or returned no token.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// HTTP transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unparseable JSON in an exchange response.
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Rejected synchronously before the request was queued.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request was drained at shutdown without being sent.
    #[error("Request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
