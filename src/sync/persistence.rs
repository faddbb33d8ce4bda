//! Debounced durable writes.
//!
//! `schedule_persist` arms at most one timer per document key. When the timer
//! fires, the replica is written if it is still dirty, so a burst of edits
//! inside one debounce window costs a single write. `flush_now` cancels the
//! pending timer and writes immediately; the caller awaits the result.
//!
//! Writes for one key are serialized by the replica's write lock, which makes
//! a `flush_now` racing an in-flight timer write safe: whichever runs second
//! finds nothing dirty and returns without touching storage. A failed write
//! leaves the replica dirty, so the next trigger retries it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use super::replica::ReplicaEntry;
use super::DocumentKey;
use crate::metrics::SyncMetrics;
use crate::storage::{DocumentStore, PersistedDocument, StorageResult};

struct PendingPersist {
    id: u64,
    abort: AbortHandle,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    debounce: Duration,
    pending: DashMap<DocumentKey, PendingPersist>,
    next_id: AtomicU64,
    metrics: Arc<SyncMetrics>,
}

/// Outcome of flushing every resident replica at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub clean: usize,
    pub failed: usize,
    pub timed_out: bool,
}

#[derive(Clone)]
pub struct PersistenceScheduler {
    inner: Arc<Inner>,
}

impl PersistenceScheduler {
    pub fn new(store: Arc<dyn DocumentStore>, debounce: Duration, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                debounce,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Number of armed debounce timers
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Arm the debounce timer for `entry` unless one is already pending.
    pub fn schedule_persist(&self, entry: &Arc<ReplicaEntry>) {
        let Entry::Vacant(slot) = self.inner.pending.entry(entry.key().clone()) else {
            return;
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.clone();
        let entry = Arc::clone(entry);
        let task = tokio::spawn(async move {
            tokio::time::sleep(scheduler.inner.debounce).await;
            scheduler
                .inner
                .pending
                .remove_if(entry.key(), |_, pending| pending.id == id);
            // Failure is logged and counted inside persist; the entry stays
            // dirty for the next trigger.
            let _ = scheduler.persist(&entry).await;
        });

        slot.insert(PendingPersist {
            id,
            abort: task.abort_handle(),
        });
    }

    /// Cancel any pending timer and write `entry` now. Returns whether a
    /// write happened.
    pub async fn flush_now(&self, entry: &Arc<ReplicaEntry>) -> StorageResult<bool> {
        if let Some((_, pending)) = self.inner.pending.remove(entry.key()) {
            pending.abort.abort();
        }
        self.persist(entry).await
    }

    /// Flush every entry concurrently, bounded by `grace`.
    pub async fn flush_all(&self, entries: Vec<Arc<ReplicaEntry>>, grace: Duration) -> FlushReport {
        let total = entries.len();
        let flushes = entries.iter().map(|entry| self.flush_now(entry));

        match tokio::time::timeout(grace, join_all(flushes)).await {
            Ok(results) => {
                let mut report = FlushReport::default();
                for result in results {
                    match result {
                        Ok(true) => report.written += 1,
                        Ok(false) => report.clean += 1,
                        Err(_) => report.failed += 1,
                    }
                }
                report
            }
            Err(_) => {
                let abandoned: Vec<String> = entries
                    .iter()
                    .filter(|e| e.is_dirty())
                    .map(|e| e.key().to_string())
                    .collect();
                error!(
                    "Shutdown flush exceeded {:?}; abandoning {} of {} documents: {:?}",
                    grace,
                    abandoned.len(),
                    total,
                    abandoned
                );
                // Entries that are clean now were either written in time or
                // never needed a write; the split is unknown after a timeout.
                FlushReport {
                    clean: total - abandoned.len(),
                    failed: abandoned.len(),
                    timed_out: true,
                    ..Default::default()
                }
            }
        }
    }

    async fn persist(&self, entry: &Arc<ReplicaEntry>) -> StorageResult<bool> {
        let _guard = entry.write_lock().lock().await;

        let Some(snapshot) = entry.persist_snapshot() else {
            return Ok(false);
        };

        let record = PersistedDocument::new(snapshot.binary_state, snapshot.text_mirror);
        match self.inner.store.save(entry.key().as_str(), &record).await {
            Ok(()) => {
                entry.mark_persisted(snapshot.generation);
                self.inner.metrics.durable_write(true);
                debug!(
                    "Persisted {} ({} bytes, generation {})",
                    entry.key(),
                    record.binary_state.len(),
                    snapshot.generation
                );
                Ok(true)
            }
            Err(e) => {
                self.inner.metrics.durable_write(false);
                warn!("Failed to persist {}: {}", entry.key(), e);
                Err(e)
            }
        }
    }
}
