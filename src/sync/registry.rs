//! Registry of resident replicas.
//!
//! The map holds one slot per document key. A slot is inserted before the
//! document is loaded and filled exactly once through a `OnceCell`, so
//! concurrent first connections to the same key share a single load and no
//! caller ever sees a half-built replica. Loads for different keys proceed in
//! parallel; only the map shard is locked, never while awaiting storage.
//!
//! Only the sweeper removes entries. Removal marks the entry evicted under
//! its own lock first, and an attach that finds an evicted entry drops the
//! stale slot and loads again, so a connection never binds to a replica that
//! is leaving memory.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use super::document::CollabDocument;
use super::persistence::PersistenceScheduler;
use super::replica::{AttachRefused, Outbox, ReplicaEntry};
use super::{DocumentKey, SyncError, SyncResult};
use crate::metrics::SyncMetrics;

#[derive(Default)]
struct Slot {
    cell: OnceCell<Arc<ReplicaEntry>>,
}

pub struct ReplicaRegistry {
    slots: DashMap<DocumentKey, Arc<Slot>>,
    scheduler: PersistenceScheduler,
    metrics: Arc<SyncMetrics>,
}

impl ReplicaRegistry {
    pub fn new(scheduler: PersistenceScheduler, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            slots: DashMap::new(),
            scheduler,
            metrics,
        }
    }

    pub fn scheduler(&self) -> &PersistenceScheduler {
        &self.scheduler
    }

    /// Return the resident replica for `key`, loading it on first use.
    pub async fn get_or_create(&self, key: &DocumentKey) -> SyncResult<Arc<ReplicaEntry>> {
        loop {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::default()))
                .clone();

            let entry = slot
                .cell
                .get_or_try_init(|| self.load(key))
                .await?
                .clone();

            if entry.is_evicted() {
                self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
                continue;
            }
            return Ok(entry);
        }
    }

    /// Resolve `key` and join its fan-out group.
    pub async fn attach(
        &self,
        key: &DocumentKey,
        connection_id: &str,
        tx: Outbox,
        max_connections: usize,
    ) -> SyncResult<Arc<ReplicaEntry>> {
        loop {
            let entry = self.get_or_create(key).await?;
            match entry.attach(connection_id, tx.clone(), max_connections) {
                Ok(count) => {
                    self.metrics.connection_attached();
                    info!("Connection {} attached to {} ({} attached)", connection_id, key, count);
                    return Ok(entry);
                }
                Err(AttachRefused::Evicted) => continue,
                Err(AttachRefused::Full) => return Err(SyncError::DocumentFull(key.clone())),
            }
        }
    }

    /// Leave the fan-out group. The last detach requests an immediate flush
    /// but leaves the entry resident for the sweeper.
    pub fn detach(&self, entry: &Arc<ReplicaEntry>, connection_id: &str) {
        let Some(remaining) = entry.detach(connection_id) else {
            return;
        };
        self.metrics.connection_detached();
        info!(
            "Connection {} detached from {} ({} attached)",
            connection_id,
            entry.key(),
            remaining
        );

        if remaining == 0 {
            let scheduler = self.scheduler.clone();
            let entry = Arc::clone(entry);
            tokio::spawn(async move {
                if let Err(e) = scheduler.flush_now(&entry).await {
                    warn!("Flush after last detach of {} failed: {}", entry.key(), e);
                }
            });
        }
    }

    /// Update `last_access` of a resident replica.
    pub fn touch(&self, key: &DocumentKey) {
        if let Some(entry) = self.get(key) {
            entry.touch();
        }
    }

    pub fn get(&self, key: &DocumentKey) -> Option<Arc<ReplicaEntry>> {
        self.slots.get(key)?.cell.get().cloned()
    }

    /// Remove `entry` if it is still idle: no connections and nothing left to
    /// write. Returns false, leaving it resident, otherwise.
    pub fn remove(&self, entry: &Arc<ReplicaEntry>) -> bool {
        if !entry.try_mark_evicted() {
            return false;
        }
        self.slots.remove_if(entry.key(), |_, slot| {
            slot.cell.get().map_or(false, |e| Arc::ptr_eq(e, entry))
        });
        self.metrics.set_resident_replicas(self.len());
        true
    }

    /// Snapshot of every resident replica
    pub fn entries(&self) -> Vec<Arc<ReplicaEntry>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.cell.get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    async fn load(&self, key: &DocumentKey) -> SyncResult<Arc<ReplicaEntry>> {
        let (doc, needs_write) = match self.scheduler.store().load(key.as_str()).await {
            Ok(Some(record)) => match CollabDocument::load(&record.binary_state) {
                Ok(doc) => {
                    info!("Loaded {} from storage", key);
                    (doc, false)
                }
                Err(e) => {
                    error!("Stored state of {} is unreadable, starting empty: {}", key, e);
                    (CollabDocument::new()?, true)
                }
            },
            Ok(None) => {
                info!(
                    "Creating new document {} for session {}",
                    key.file_path(),
                    key.session_id()
                );
                (CollabDocument::new()?, false)
            }
            Err(e) => {
                error!("Failed to load {}, starting empty: {}", key, e);
                (CollabDocument::new()?, true)
            }
        };

        let entry = Arc::new(ReplicaEntry::new(key.clone(), doc, needs_write));
        self.metrics.set_resident_replicas(self.len());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, PersistedDocument};
    use crate::sync::testing::{client_from_frames, drain, edit, key};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry(store: &Arc<MemoryStore>) -> Arc<ReplicaRegistry> {
        let metrics = Arc::new(SyncMetrics::new());
        let scheduler =
            PersistenceScheduler::new(store.clone(), Duration::from_millis(2000), metrics.clone());
        Arc::new(ReplicaRegistry::new(scheduler, metrics))
    }

    #[tokio::test]
    async fn test_concurrent_creation_loads_once() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let k = key("s1:main.js");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let k = k.clone();
                tokio::spawn(async move { registry.get_or_create(&k).await.unwrap() })
            })
            .collect();

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap());
        }

        assert_eq!(store.load_count(), 1);
        assert_eq!(registry.len(), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
    }

    #[tokio::test]
    async fn test_loads_persisted_state() {
        let store = Arc::new(MemoryStore::new());
        let mut doc = CollabDocument::new().unwrap();
        doc.splice_text(0, 0, "from disk").unwrap();
        store.insert("s1:a.js", PersistedDocument::new(doc.save(), "from disk"));

        let registry = registry(&store);
        let entry = registry.get_or_create(&key("s1:a.js")).await.unwrap();

        assert_eq!(entry.text(), "from disk");
        assert!(!entry.is_dirty());
    }

    #[tokio::test]
    async fn test_load_failure_starts_empty_and_dirty() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_loads(true);
        let registry = registry(&store);

        let entry = registry.get_or_create(&key("s1:a.js")).await.unwrap();

        assert_eq!(entry.text(), "");
        assert!(entry.is_dirty());
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_empty_and_dirty() {
        let store = Arc::new(MemoryStore::new());
        store.insert("s1:a.js", PersistedDocument::new(vec![1, 2, 3], "junk"));
        let registry = registry(&store);

        let entry = registry.get_or_create(&key("s1:a.js")).await.unwrap();

        assert_eq!(entry.text(), "");
        assert!(entry.is_dirty());
    }

    #[tokio::test]
    async fn test_last_detach_flushes_and_reload_matches() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let k = key("s1:a.js");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let entry = registry.attach(&k, "conn-a", tx, 50).await.unwrap();
        let mut client = client_from_frames(&drain(&mut rx));
        entry
            .apply_update("conn-a", edit(&mut client, 0, "saved on leave"))
            .unwrap();

        registry.detach(&entry, "conn-a");
        // The flush runs on its own task.
        for _ in 0..100 {
            if !entry.is_dirty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!entry.is_dirty());
        assert_eq!(store.save_count(), 1);

        // Entry stays resident until swept.
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&entry));
        assert!(registry.is_empty());

        let reloaded = registry.get_or_create(&k).await.unwrap();
        assert!(!Arc::ptr_eq(&reloaded, &entry));
        assert_eq!(reloaded.text(), "saved on leave");
    }

    #[tokio::test]
    async fn test_remove_refuses_attached_or_dirty() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let k = key("s1:a.js");

        let (tx, _rx) = mpsc::unbounded_channel();
        let entry = registry.attach(&k, "conn-a", tx, 50).await.unwrap();
        assert!(!registry.remove(&entry));

        store.set_fail_loads(true);
        let dirty = registry.get_or_create(&key("s1:b.js")).await.unwrap();
        assert!(!registry.remove(&dirty));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_attach_after_eviction_reloads() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let k = key("s1:a.js");

        let stale = registry.get_or_create(&k).await.unwrap();
        assert!(stale.try_mark_evicted());

        let (tx, _rx) = mpsc::unbounded_channel();
        let entry = registry.attach(&k, "conn-a", tx, 50).await.unwrap();

        assert!(!Arc::ptr_eq(&entry, &stale));
        assert_eq!(entry.connection_count(), 1);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_document_full() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let k = key("s1:a.js");

        let (tx, _rx1) = mpsc::unbounded_channel();
        registry.attach(&k, "conn-a", tx, 1).await.unwrap();
        let (tx, _rx2) = mpsc::unbounded_channel();
        let result = registry.attach(&k, "conn-b", tx, 1).await;

        assert!(matches!(result, Err(SyncError::DocumentFull(_))));
    }
}
