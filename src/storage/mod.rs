//! Storage module for persistent document snapshots.
//!
//! The synchronization core only needs two things from storage: load the last
//! snapshot of a document key and write a new one. Both are expressed by the
//! [`DocumentStore`] trait so the server can run against Sled in production and
//! against an in-process map in tests or ephemeral deployments.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable record for one document key.
///
/// `binary_state` is authoritative. `text_mirror` is a plain-text projection
/// kept for consumers that cannot read the CRDT encoding (search, previews)
/// and is always re-derivable from `binary_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDocument {
    /// Full-state CRDT encoding
    pub binary_state: Vec<u8>,
    /// Plain-text projection of the document content
    pub text_mirror: String,
    /// Unix timestamp (milliseconds) of the write
    pub updated_at: i64,
}

impl PersistedDocument {
    pub fn new(binary_state: Vec<u8>, text_mirror: impl Into<String>) -> Self {
        Self {
            binary_state,
            text_mirror: text_mirror.into(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Key-based snapshot store used by the persistence scheduler.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Load the last persisted snapshot for `key`, if any.
    async fn load(&self, key: &str) -> StorageResult<Option<PersistedDocument>>;

    /// Replace the persisted snapshot for `key`.
    async fn save(&self, key: &str, document: &PersistedDocument) -> StorageResult<()>;

    /// Force buffered writes to durable media.
    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

#[cfg(test)]
impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }
}
