//! Session errors

use tandem_core::{ConfigError, ProtocolError, SnapshotError};
use thiserror::Error;

/// Errors surfaced by a running session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Bad configuration; fatal at start
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Relay socket or peer connection failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed channel message or envelope; the message is dropped
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Request for something outside the shared workspace
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Negotiation or connect did not finish in time
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("workspace error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("session closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(ProtocolError::from(e))
    }
}
