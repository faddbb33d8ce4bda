//! In-process document store.
//!
//! Used for `STORAGE_BACKEND=memory` deployments and as the storage double in
//! tests, where it can inject write latency and failures.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{DocumentStore, PersistedDocument, StorageError, StorageResult};

#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<String, PersistedDocument>,
    save_delay: Mutex<Option<Duration>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every subsequent save by `delay` before it lands.
    #[cfg(test)]
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.lock() = delay;
    }

    #[cfg(test)]
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    #[cfg(test)]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of load calls, successful or not
    #[cfg(test)]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<PersistedDocument> {
        self.documents.get(key).map(|d| d.clone())
    }

    #[cfg(test)]
    pub fn insert(&self, key: impl Into<String>, document: PersistedDocument) {
        self.documents.insert(key.into(), document);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, key: &str) -> StorageResult<Option<PersistedDocument>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("load of {}", key)));
        }
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, document: &PersistedDocument) -> StorageResult<()> {
        let delay = *self.save_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("save of {}", key)));
        }
        self.documents.insert(key.to_string(), document.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
