//! Synchronization module for CRDT-based real-time collaboration.
//!
//! This module implements the core synchronization service:
//! - Binary WebSocket protocol ([`protocol`])
//! - One live Automerge replica per open document ([`document`], [`replica`])
//! - Replica lifecycle: load-or-create, attach/detach, eviction ([`registry`], [`sweeper`])
//! - Debounced durable writes ([`persistence`])
//! - Per-address connection admission ([`admission`])
//! - Ephemeral awareness state ([`presence`])

pub mod admission;
pub mod document;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod sweeper;

pub use document::CollabDocument;
pub use server::{SyncServer, SyncServerConfig};

use std::fmt;
use thiserror::Error;

/// Unique identifier for one live connection
pub type ConnectionId = String;

/// Maximum accepted document key length in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Stable identifier of one replicated document: `sessionId:filePath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    raw: String,
    split: usize,
}

/// Reasons a raw document key is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("document key is empty")]
    Empty,

    #[error("document key exceeds {} bytes", MAX_KEY_LEN)]
    TooLong,

    #[error("document key contains control characters")]
    ControlCharacter,

    #[error("document key must have the form sessionId:filePath")]
    MissingSeparator,

    #[error("session identifier is empty or malformed")]
    InvalidSession,

    #[error("file path has an empty or malformed segment")]
    InvalidPath,
}

impl DocumentKey {
    /// Validate an already URL-decoded key.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong);
        }
        if raw.chars().any(char::is_control) {
            return Err(KeyError::ControlCharacter);
        }

        let split = raw.find(':').ok_or(KeyError::MissingSeparator)?;
        let (session, path) = (&raw[..split], &raw[split + 1..]);

        if session.is_empty() || session.contains('/') || session.chars().any(char::is_whitespace) {
            return Err(KeyError::InvalidSession);
        }

        let path = path.strip_prefix('/').unwrap_or(path);
        if path.is_empty() {
            return Err(KeyError::InvalidPath);
        }
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(KeyError::InvalidPath);
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            split,
        })
    }

    /// Owning session identifier
    pub fn session_id(&self) -> &str {
        &self.raw[..self.split]
    }

    /// File path within the session
    pub fn file_path(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection refused by admission control
    #[error("Connection rejected: {0}")]
    Rejected(#[from] admission::AdmissionError),

    /// Malformed document key
    #[error("Invalid document key: {0}")]
    InvalidKey(#[from] KeyError),

    /// Too many connections on one document
    #[error("Document {0} is full")]
    DocumentFull(DocumentKey),

    /// Server is draining for shutdown
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Frame could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// Update could not be merged into the replica
    #[error("Document error: {0}")]
    Document(#[from] document::DocumentError),

    /// Awareness payload refused
    #[error("Awareness error: {0}")]
    Awareness(#[from] presence::PresenceError),

    /// Connection is no longer attached to its document
    #[error("Connection {0} is not attached")]
    NotAttached(ConnectionId),
}

impl SyncError {
    /// WebSocket close code reported to the client for this error
    pub fn close_code(&self) -> u16 {
        match self {
            SyncError::Rejected(_)
            | SyncError::InvalidKey(_)
            | SyncError::DocumentFull(_)
            | SyncError::NotAttached(_) => CLOSE_POLICY_VIOLATION,
            SyncError::ShuttingDown => CLOSE_GOING_AWAY,
            SyncError::Protocol(_) | SyncError::Document(_) | SyncError::Awareness(_) => {
                CLOSE_INVALID_PAYLOAD
            }
        }
    }

    /// Error code carried by the `Error` frame sent before closing
    pub fn error_code(&self) -> protocol::ErrorCode {
        use protocol::ErrorCode;
        match self {
            SyncError::Rejected(_) => ErrorCode::RateLimited,
            SyncError::InvalidKey(_) => ErrorCode::InvalidKey,
            SyncError::DocumentFull(_) => ErrorCode::DocumentFull,
            SyncError::ShuttingDown => ErrorCode::ShuttingDown,
            SyncError::Protocol(protocol::ProtocolError::VersionMismatch(..)) => {
                ErrorCode::VersionMismatch
            }
            SyncError::Protocol(_) | SyncError::Awareness(_) => ErrorCode::InvalidMessage,
            SyncError::Document(_) => ErrorCode::InvalidUpdate,
            SyncError::NotAttached(_) => ErrorCode::ServerError,
        }
    }
}

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Client-side helpers shared by the sync tests
#[cfg(test)]
pub(crate) mod testing {
    use super::protocol::ServerMessage;
    use super::replica::ReplicaEntry;
    use super::{CollabDocument, DocumentKey};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    pub type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    pub fn key(raw: &str) -> DocumentKey {
        DocumentKey::parse(raw).unwrap()
    }

    pub fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Client replica built from the baseline in a handshake
    pub fn client_from_frames(frames: &[ServerMessage]) -> CollabDocument {
        for frame in frames {
            if let ServerMessage::SyncStep2 { data } = frame {
                return CollabDocument::load(data).unwrap();
            }
        }
        panic!("no baseline in handshake");
    }

    /// Local insert, returned as an incremental update
    pub fn edit(doc: &mut CollabDocument, pos: usize, text: &str) -> Vec<u8> {
        doc.splice_text(pos, 0, text).unwrap();
        doc.take_update()
    }

    /// Two changes in one frame: the first is new, the second reuses a
    /// sequence number that a replica holding an edit by `existing_actor`
    /// already has.
    pub fn partially_conflicting_frame(existing_actor: &[u8]) -> Vec<u8> {
        let mut fresh = CollabDocument::with_actor(b"actor-fresh");
        fresh.splice_text(0, 0, "y").unwrap();
        let mut reused = CollabDocument::with_actor(existing_actor);
        reused.splice_text(0, 0, "z").unwrap();

        let mut frame = fresh.take_update();
        frame.extend(reused.take_update());
        frame
    }

    /// Attach `connection_id` to `entry` and return its client replica.
    pub fn join(entry: &ReplicaEntry, connection_id: &str) -> (CollabDocument, Inbox) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        entry.attach(connection_id, tx, usize::MAX).unwrap();
        let client = client_from_frames(&drain(&mut rx));
        (client, rx)
    }

    pub fn fresh_entry(raw: &str) -> Arc<ReplicaEntry> {
        Arc::new(ReplicaEntry::new(key(raw), CollabDocument::new().unwrap(), false))
    }
}
