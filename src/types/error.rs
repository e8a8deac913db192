//! Error types for tether

use thiserror::Error;

/// Errors surfaced by the shared socket and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TetherError {
    /// Operation not allowed in the current ready state (the `InvalidStateError` class)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Socket has been disposed")]
    Disposed,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// Whether this error came from a synchronous local misuse rather than infrastructure
    pub fn is_local(&self) -> bool {
        matches!(self, Self::InvalidState(_) | Self::Disposed | Self::Config(_))
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TetherError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<async_nats::Error> for TetherError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

/// Result type alias for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
