//! SyncServer: connection multiplexing and process-level lifecycle.
//!
//! The server ties the pieces together:
//! - admission and key validation before any registry access
//! - one [`Session`] per attached connection, bound to its replica
//! - dispatch of decoded client frames into the merge/broadcast pipeline
//! - background sweeping and bookkeeping
//! - the shutdown sequence: refuse new connections, tell live ones to go,
//!   then flush every resident replica within a grace period

use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::admission::AdmissionControl;
use super::persistence::{FlushReport, PersistenceScheduler};
use super::protocol::{ClientMessage, ServerMessage};
use super::registry::ReplicaRegistry;
use super::replica::{Outbox, ReplicaEntry};
use super::sweeper::{EvictionSweeper, SweeperConfig};
use super::{ConnectionId, DocumentKey, SyncError, SyncResult};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::storage::DocumentStore;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Maximum connections attached to one document
    pub max_connections_per_document: usize,
    /// Delay between the first unsaved update and its durable write
    pub persist_debounce: Duration,
    /// Idle eviction
    pub sweeper: SweeperConfig,
    /// Upper bound on the shutdown flush
    pub shutdown_grace: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            max_connections_per_document: 50,
            persist_debounce: Duration::from_millis(2000),
            sweeper: SweeperConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A connection attached to its document
pub struct Session {
    connection_id: ConnectionId,
    entry: Arc<ReplicaEntry>,
}

impl Session {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn key(&self) -> &DocumentKey {
        self.entry.key()
    }
}

/// The main synchronization server
pub struct SyncServer {
    config: SyncServerConfig,
    registry: Arc<ReplicaRegistry>,
    admission: Arc<dyn AdmissionControl>,
    metrics: Arc<SyncMetrics>,
    started_at: Instant,
    closing: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        admission: Arc<dyn AdmissionControl>,
        config: SyncServerConfig,
    ) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let scheduler = PersistenceScheduler::new(store, config.persist_debounce, metrics.clone());
        let registry = Arc::new(ReplicaRegistry::new(scheduler, metrics.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            admission,
            metrics,
            started_at: Instant::now(),
            closing: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Validate, admit, and attach a new connection. Nothing in the registry
    /// is touched unless the key is valid and the address is admitted.
    pub async fn connect(&self, addr: IpAddr, raw_key: &str, tx: Outbox) -> SyncResult<Session> {
        let result = self.try_connect(addr, raw_key, tx).await;
        if let Err(e) = &result {
            let reason = match e {
                SyncError::Rejected(_) => "rate_limited",
                SyncError::InvalidKey(_) => "invalid_key",
                SyncError::DocumentFull(_) => "document_full",
                SyncError::ShuttingDown => "shutting_down",
                _ => "error",
            };
            self.metrics.connection_rejected(reason);
            warn!("Rejected connection from {} for {:?}: {}", addr, raw_key, e);
        }
        result
    }

    async fn try_connect(&self, addr: IpAddr, raw_key: &str, tx: Outbox) -> SyncResult<Session> {
        if self.is_closing() {
            return Err(SyncError::ShuttingDown);
        }
        let key = DocumentKey::parse(raw_key)?;
        self.admission.admit(addr).await?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let entry = self
            .registry
            .attach(&key, &connection_id, tx, self.config.max_connections_per_document)
            .await?;

        Ok(Session {
            connection_id,
            entry,
        })
    }

    /// Detach a session. Safe to call more than once.
    pub fn disconnect(&self, session: &Session) {
        self.registry.detach(&session.entry, &session.connection_id);
    }

    /// Handle one decoded client frame. Returns `Ok(false)` when the client
    /// asked to end the session.
    pub fn handle_message(&self, session: &Session, msg: ClientMessage, tx: &Outbox) -> SyncResult<bool> {
        match msg {
            ClientMessage::SyncStep1 { heads } => {
                let data = session.entry.changes_since(&heads);
                let _ = tx.send(ServerMessage::SyncStep2 { data });
            }
            ClientMessage::SyncStep2 { data } => {
                // A client with nothing the server lacks answers with an empty step.
                if !data.is_empty() {
                    self.on_client_update(session, data)?;
                }
            }
            ClientMessage::Update { data } => {
                self.on_client_update(session, data)?;
            }
            ClientMessage::Awareness { data } => {
                session
                    .entry
                    .publish_awareness(&session.connection_id, data)?;
            }
            ClientMessage::Ping { timestamp } => {
                self.registry.touch(session.key());
                let _ = tx.send(ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis(),
                });
            }
            ClientMessage::Goodbye { reason } => {
                info!(
                    "Connection {} said goodbye: {}",
                    session.connection_id,
                    reason.as_deref().unwrap_or("no reason")
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Merge an update into the session's replica, relay it, and schedule a
    /// durable write.
    pub fn on_client_update(&self, session: &Session, data: Vec<u8>) -> SyncResult<()> {
        let len = data.len();
        match session.entry.apply_update(&session.connection_id, data) {
            Ok(()) => {
                self.metrics.update_applied();
                self.registry.scheduler().schedule_persist(&session.entry);
                debug!(
                    "Applied {} byte update from {} on {}",
                    len,
                    session.connection_id,
                    session.key()
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.update_rejected();
                warn!(
                    "Dropping update from {} on {}: {}",
                    session.connection_id,
                    session.key(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Start background tasks (eviction sweep, bookkeeping)
    pub fn start_background_tasks(self: &Arc<Self>) -> BackgroundTaskHandles {
        let sweeper = EvictionSweeper::new(
            self.registry.clone(),
            self.config.sweeper,
            self.metrics.clone(),
        );
        let sweep_task = sweeper.spawn(self.shutdown_receiver());

        let server = self.clone();
        // Subscribe here, not in the task: a shutdown sent before the task
        // is first polled would otherwise be missed.
        let mut shutdown = self.shutdown_receiver();
        let maintenance_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.sweeper.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.admission.prune();
                        server.metrics.set_resident_replicas(server.registry.len());
                    }
                    _ = shutdown.recv() => {
                        debug!("Maintenance task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            sweep_task,
            maintenance_task,
        }
    }

    /// Stop admitting connections and tell live ones to close.
    pub fn begin_shutdown(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            info!("Shutdown started; refusing new connections");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Full shutdown: flush every resident replica, attached or not, within
    /// the grace period, then make storage durable.
    pub async fn shutdown(&self) -> FlushReport {
        self.begin_shutdown();

        let entries = self.registry.entries();
        info!("Flushing {} resident documents", entries.len());
        let report = self
            .registry
            .scheduler()
            .flush_all(entries, self.config.shutdown_grace)
            .await;

        if let Err(e) = self.registry.scheduler().store().flush().await {
            error!("Final storage flush failed: {}", e);
        }

        info!(
            "Shutdown flush: {} written, {} clean, {} failed{}",
            report.written,
            report.clean,
            report.failed,
            if report.timed_out { " (timed out)" } else { "" }
        );
        report
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        let entries = self.registry.entries();
        ServerStats {
            resident_documents: entries.len(),
            attached_connections: entries.iter().map(|e| e.connection_count()).sum(),
            dirty_documents: entries.iter().filter(|e| e.is_dirty()).count(),
            pending_writes: self.registry.scheduler().pending_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            counters: self.metrics.snapshot(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub resident_documents: usize,
    pub attached_connections: usize,
    pub dirty_documents: usize,
    pub pending_writes: usize,
    pub uptime_seconds: u64,
    pub counters: MetricsSnapshot,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweep_task: tokio::task::JoinHandle<()>,
    pub maintenance_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.sweep_task, self.maintenance_task);
    }
}
