//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream connection error.
    #[error("Upstream error: {0}")]
    Upstream(#[from] common::Error),

    /// The session's outgoing channel is gone.
    #[error("Session channel closed")]
    SessionSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
