//! Agentdeck error types

use thiserror::Error;

/// Agentdeck error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket is not open
    #[error("Not connected")]
    NotConnected,

    /// Handshake has not completed (no connection id yet)
    #[error("Connection not established: no connection id")]
    HandshakePending,

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Server rejected the request with an error status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Authentication rejected; the stored token has been cleared
    #[error("Authentication rejected")]
    Unauthorized,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for agentdeck operations
pub type Result<T> = std::result::Result<T, Error>;
