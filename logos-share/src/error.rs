//! Error types for the share layer.
//!
//! Every failure category is recoverable: the worst outcome of any of them
//! is a desynchronized workspace, fixed by creating or joining a new room.

use std::path::PathBuf;

/// Wire-level encode/decode failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// A path that is empty, has an empty segment, or tries to escape the root.
    #[error("invalid document path: {0:?}")]
    InvalidPath(String),
}

/// Transport channel failures. Logged and non-fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport socket error: {0}")]
    Socket(String),
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Workspace store failures, surfaced per operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid glob pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Editor surface failures.
#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("no active document")]
    NoActiveDocument,
    #[error("cannot open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session has been disposed")]
    Disposed,
    #[error("timed out waiting for {0}")]
    AckTimeout(&'static str),
    /// The relay refused `create room`/`join room`, or the channel closed
    /// before it answered.
    #[error("{request} rejected: {reason}")]
    RoomRejected { request: &'static str, reason: String },
    #[error("event subscription already taken")]
    SubscriptionTaken,
    #[error("config error: {0}")]
    Config(String),
}
