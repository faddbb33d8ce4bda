//! Sled-based storage implementation for document snapshots.
//!
//! One tree, `documents`, maps the document key bytes to a bincode-encoded
//! [`PersistedDocument`]. Writes replace the whole record and are flushed
//! before `save` returns, so a write the scheduler reports as done survives a
//! crash. The debounce upstream bounds how often that happens.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{DocumentStore, PersistedDocument, StorageConfig, StorageError, StorageResult};

const TREE_DOCUMENTS: &str = "documents";

/// Sled-based document store
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    documents: Tree,
}

impl SledStore {
    /// Open or create a new document store at the given path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
        })
    }

    /// Number of persisted documents
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn decode(key: &str, bytes: &[u8]) -> StorageResult<PersistedDocument> {
        bincode::deserialize(bytes)
            .map_err(|e| StorageError::Corruption(format!("{}: {}", key, e)))
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn load(&self, key: &str) -> StorageResult<Option<PersistedDocument>> {
        match self.documents.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, document: &PersistedDocument) -> StorageResult<()> {
        let bytes = bincode::serialize(document)?;
        self.documents.insert(key.as_bytes(), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Only the last handle flushes; clones share the same Db.
        if Arc::strong_count(&self.db) == 1 {
            let _ = self.db.flush();
        }
    }
}
