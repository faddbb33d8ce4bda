//! Observability signals for the synchronization service.
//!
//! Every signal is kept twice: an atomic counter read by `GET /health`, and a
//! `metrics` facade call so any installed recorder (Prometheus, statsd) sees
//! the same numbers. Facade metrics are prefixed with `collab_`; counters end
//! in `_total`.

use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SyncMetrics {
    attached_connections: AtomicU64,
    resident_replicas: AtomicU64,
    updates_applied: AtomicU64,
    updates_rejected: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    evictions: AtomicU64,
    connections_rejected: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub attached_connections: u64,
    pub resident_replicas: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub evictions: u64,
    pub connections_rejected: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attached(&self) {
        let now = self.attached_connections.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("collab_attached_connections").set(now as f64);
    }

    pub fn connection_detached(&self) {
        let prev = self
            .attached_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        gauge!("collab_attached_connections").set(prev.saturating_sub(1) as f64);
    }

    pub fn set_resident_replicas(&self, count: usize) {
        self.resident_replicas.store(count as u64, Ordering::Relaxed);
        gauge!("collab_resident_replicas").set(count as f64);
    }

    pub fn update_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
        counter!("collab_updates_applied_total").increment(1);
    }

    pub fn update_rejected(&self) {
        self.updates_rejected.fetch_add(1, Ordering::Relaxed);
        counter!("collab_updates_rejected_total").increment(1);
    }

    /// Record a durable write attempt.
    pub fn durable_write(&self, success: bool) {
        let status = if success {
            self.writes_ok.fetch_add(1, Ordering::Relaxed);
            "success"
        } else {
            self.writes_failed.fetch_add(1, Ordering::Relaxed);
            "failure"
        };
        counter!("collab_durable_writes_total", "status" => status).increment(1);
    }

    pub fn replica_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        counter!("collab_evictions_total").increment(1);
    }

    pub fn connection_rejected(&self, reason: &'static str) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        counter!("collab_connections_rejected_total", "reason" => reason).increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attached_connections: self.attached_connections.load(Ordering::Relaxed),
            resident_replicas: self.resident_replicas.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_without_recorder() {
        let metrics = SyncMetrics::new();

        metrics.connection_attached();
        metrics.connection_attached();
        metrics.connection_detached();
        metrics.update_applied();
        metrics.durable_write(true);
        metrics.durable_write(false);
        metrics.replica_evicted();
        metrics.connection_rejected("rate_limited");
        metrics.set_resident_replicas(4);

        let snap = metrics.snapshot();
        assert_eq!(snap.attached_connections, 1);
        assert_eq!(snap.updates_applied, 1);
        assert_eq!(snap.writes_ok, 1);
        assert_eq!(snap.writes_failed, 1);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.connections_rejected, 1);
        assert_eq!(snap.resident_replicas, 4);
    }

    #[test]
    fn test_detach_never_underflows() {
        let metrics = SyncMetrics::new();
        metrics.connection_detached();
        assert_eq!(metrics.snapshot().attached_connections, 0);
    }
}
