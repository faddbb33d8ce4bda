//! Periodic eviction of idle replicas.
//!
//! Each pass looks for replicas with no attached connections whose last
//! access is older than the inactivity threshold, flushes them, and removes
//! them only if the post-flush check still finds them detached and clean.
//! The check runs under the replica's own lock, so it holds whatever the
//! relative timing of the debounce timer, the sweep interval, and a
//! connection arriving mid-flush.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::ReplicaRegistry;
use crate::metrics::SyncMetrics;

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// Time between passes
    pub interval: Duration,
    /// Idle time after which a detached replica is evicted
    pub inactivity_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(300),
        }
    }
}

pub struct EvictionSweeper {
    registry: Arc<ReplicaRegistry>,
    config: SweeperConfig,
    metrics: Arc<SyncMetrics>,
}

impl EvictionSweeper {
    pub fn new(registry: Arc<ReplicaRegistry>, config: SweeperConfig, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            registry,
            config,
            metrics,
        }
    }

    /// Run one pass. Returns the number of evicted replicas.
    pub async fn sweep(&self) -> usize {
        let mut evicted = 0;

        for entry in self.registry.entries() {
            if entry.connection_count() > 0 || entry.idle_for() <= self.config.inactivity_timeout {
                continue;
            }

            if let Err(e) = self.registry.scheduler().flush_now(&entry).await {
                warn!("Keeping {} resident, flush failed: {}", entry.key(), e);
                continue;
            }

            if self.registry.remove(&entry) {
                evicted += 1;
                self.metrics.replica_evicted();
                info!("Evicted idle document {}", entry.key());
            } else {
                debug!("{} became active during flush, keeping it", entry.key());
            }
        }

        evicted
    }

    /// Run passes on `interval` until shutdown is signalled.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = self.sweep().await;
                        if evicted > 0 {
                            debug!("Sweep evicted {} documents", evicted);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Eviction sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::sync::persistence::PersistenceScheduler;
    use crate::sync::testing::{client_from_frames, drain, edit, key};
    use tokio::sync::mpsc;

    const INACTIVITY: Duration = Duration::from_secs(300);

    fn setup(store: &Arc<MemoryStore>) -> (Arc<ReplicaRegistry>, EvictionSweeper) {
        setup_with_debounce(store, Duration::from_millis(2000))
    }

    fn setup_with_debounce(
        store: &Arc<MemoryStore>,
        debounce: Duration,
    ) -> (Arc<ReplicaRegistry>, EvictionSweeper) {
        let metrics = Arc::new(SyncMetrics::new());
        let scheduler = PersistenceScheduler::new(store.clone(), debounce, metrics.clone());
        let registry = Arc::new(ReplicaRegistry::new(scheduler, metrics.clone()));
        let sweeper = EvictionSweeper::new(
            registry.clone(),
            SweeperConfig {
                interval: Duration::from_secs(60),
                inactivity_timeout: INACTIVITY,
            },
            metrics,
        );
        (registry, sweeper)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_replica_is_flushed_and_evicted() {
        let store = Arc::new(MemoryStore::new());
        let (registry, sweeper) = setup(&store);
        let k = key("s1:a.js");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let entry = registry.attach(&k, "conn-a", tx, 50).await.unwrap();
        let mut client = client_from_frames(&drain(&mut rx));
        entry.apply_update("conn-a", edit(&mut client, 0, "bye")).unwrap();
        assert!(entry.detach("conn-a").is_some());

        assert_eq!(sweeper.sweep().await, 0, "not idle yet");

        tokio::time::advance(INACTIVITY + Duration::from_secs(1)).await;
        assert_eq!(sweeper.sweep().await, 1);

        assert!(registry.is_empty());
        assert_eq!(store.get("s1:a.js").unwrap().text_mirror, "bye");
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_cancels_pending_debounce_write() {
        let store = Arc::new(MemoryStore::new());
        let debounce = INACTIVITY * 2;
        let (registry, sweeper) = setup_with_debounce(&store, debounce);
        let k = key("s1:a.js");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let entry = registry.attach(&k, "conn-a", tx, 50).await.unwrap();
        let mut client = client_from_frames(&drain(&mut rx));
        entry.apply_update("conn-a", edit(&mut client, 0, "late")).unwrap();
        registry.scheduler().schedule_persist(&entry);
        entry.detach("conn-a");
        assert_eq!(registry.scheduler().pending_count(), 1);

        tokio::time::advance(INACTIVITY + Duration::from_secs(1)).await;
        assert_eq!(registry.scheduler().pending_count(), 1, "timer still armed");
        assert_eq!(sweeper.sweep().await, 1);

        assert!(registry.is_empty());
        assert_eq!(registry.scheduler().pending_count(), 0);
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.get("s1:a.js").unwrap().text_mirror, "late");

        // The cancelled timer must not write again once its deadline passes.
        tokio::time::sleep(debounce).await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_replica_is_never_evicted() {
        let store = Arc::new(MemoryStore::new());
        let (registry, sweeper) = setup(&store);

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach(&key("s1:a.js"), "conn-a", tx, 50).await.unwrap();

        tokio::time::advance(INACTIVITY * 2).await;
        assert_eq!(sweeper.sweep().await, 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_during_flush_prevents_eviction() {
        let store = Arc::new(MemoryStore::new());
        let (registry, sweeper) = setup(&store);
        let k = key("s1:a.js");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let entry = registry.attach(&k, "conn-a", tx, 50).await.unwrap();
        let mut client = client_from_frames(&drain(&mut rx));
        entry.apply_update("conn-a", edit(&mut client, 0, "x")).unwrap();
        entry.detach("conn-a");
        tokio::time::advance(INACTIVITY + Duration::from_secs(1)).await;

        // Hold the sweeper inside its flush long enough for a new connection.
        store.set_save_delay(Some(Duration::from_secs(5)));
        let sweep = tokio::spawn(async move { sweeper.sweep().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let (tx, mut rx_b) = mpsc::unbounded_channel();
        let attached = registry.attach(&k, "conn-b", tx, 50).await.unwrap();
        assert!(Arc::ptr_eq(&attached, &entry));

        assert_eq!(sweep.await.unwrap(), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(entry.connection_count(), 1);
        assert_eq!(store.save_count(), 1);

        let client_b = client_from_frames(&drain(&mut rx_b));
        assert_eq!(client_b.text().unwrap(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_keeps_replica() {
        let store = Arc::new(MemoryStore::new());
        let (registry, sweeper) = setup(&store);

        store.set_fail_loads(true);
        let entry = registry.get_or_create(&key("s1:a.js")).await.unwrap();
        store.set_fail_saves(true);

        tokio::time::advance(INACTIVITY + Duration::from_secs(1)).await;
        assert_eq!(sweeper.sweep().await, 0);
        assert!(entry.is_dirty());
        assert_eq!(registry.len(), 1);

        store.set_fail_saves(false);
        assert_eq!(sweeper.sweep().await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (registry, sweeper) = setup(&store);
        registry.get_or_create(&key("s1:a.js")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = sweeper.spawn(shutdown_rx);

        tokio::time::sleep(INACTIVITY + Duration::from_secs(120)).await;
        assert!(registry.is_empty());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
