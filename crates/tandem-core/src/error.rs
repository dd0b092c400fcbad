//! Error types for the Tandem protocol

use thiserror::Error;

/// Protocol-level errors
///
/// A message that fails with one of these is dropped; the session keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("path traversal attempt blocked: {0}")]
    PathTraversal(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub(crate) fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(e: base64::DecodeError) -> Self {
        ProtocolError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

/// Workspace scanning and history errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace root is not a directory: {0}")]
    NotADirectory(String),

    #[error("path traversal attempt blocked: {0}")]
    PathTraversal(String),

    #[error("nothing to roll back")]
    NothingToRollBack,
}

impl SnapshotError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<ProtocolError> for SnapshotError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::PathTraversal(reason) => SnapshotError::PathTraversal(reason),
            other => SnapshotError::PathTraversal(other.to_string()),
        }
    }
}
