//! Live replica of one document and its fan-out group.
//!
//! A [`ReplicaEntry`] owns the CRDT document, the set of attached
//! connections, and their awareness states behind one mutex. Every step that
//! must be ordered per document (apply then broadcast, attach then baseline,
//! detach then notify) runs inside that mutex, so two updates on the same key
//! never interleave and a connection that attaches is queued behind its
//! baseline before any later broadcast can reach it. Nothing inside the lock
//! awaits; outbound frames go to unbounded per-connection queues.
//!
//! `dirty` is tracked as a pair of generations: `applied_gen` advances on
//! every merged update and `persisted_gen` records the generation covered by
//! the last successful write. A write that races with new updates therefore
//! never clears the dirty state it did not cover.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::document::{heads_from_bytes, heads_to_bytes, CollabDocument};
use super::presence::DocumentAwareness;
use super::protocol::{ServerMessage, PROTOCOL_VERSION};
use super::{ConnectionId, DocumentKey, SyncError, SyncResult};

/// Outbound queue of one connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Why an attach did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachRefused {
    /// The entry was evicted; look the key up again
    Evicted,
    /// The fan-out group is at capacity
    Full,
}

struct ReplicaState {
    doc: CollabDocument,
    connections: HashMap<ConnectionId, Outbox>,
    awareness: DocumentAwareness,
    last_access: Instant,
    applied_gen: u64,
    persisted_gen: u64,
    evicted: bool,
}

impl ReplicaState {
    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    fn is_dirty(&self) -> bool {
        self.applied_gen != self.persisted_gen
    }

    /// Send to every attached connection except `exclude`.
    fn broadcast(&self, key: &DocumentKey, exclude: &str, msg: &ServerMessage) {
        for (id, tx) in &self.connections {
            if id == exclude {
                continue;
            }
            if tx.send(msg.clone()).is_err() {
                debug!("Dropping frame for closing connection {} on {}", id, key);
            }
        }
    }
}

/// Durable-write snapshot taken under the replica lock
#[derive(Debug, Clone)]
pub struct PersistSnapshot {
    pub generation: u64,
    pub binary_state: Vec<u8>,
    pub text_mirror: String,
}

/// One resident document
pub struct ReplicaEntry {
    key: DocumentKey,
    state: Mutex<ReplicaState>,
    /// Serializes durable writes for this key
    write_lock: tokio::sync::Mutex<()>,
}

impl ReplicaEntry {
    /// Wrap a freshly loaded or created document. `needs_write` marks it
    /// dirty from the start.
    pub fn new(key: DocumentKey, doc: CollabDocument, needs_write: bool) -> Self {
        Self {
            key,
            state: Mutex::new(ReplicaState {
                doc,
                connections: HashMap::new(),
                awareness: DocumentAwareness::new(),
                last_access: Instant::now(),
                applied_gen: u64::from(needs_write),
                persisted_gen: 0,
                evicted: false,
            }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    /// Join the fan-out group and queue the handshake: `Welcome`, the
    /// full-state baseline, the server heads, then the other connections'
    /// awareness. Returns the new attached count.
    pub fn attach(
        &self,
        connection_id: &str,
        tx: Outbox,
        max_connections: usize,
    ) -> Result<usize, AttachRefused> {
        let mut state = self.state.lock();
        if state.evicted {
            return Err(AttachRefused::Evicted);
        }
        if state.connections.len() >= max_connections {
            return Err(AttachRefused::Full);
        }

        let baseline = state.doc.save();
        let heads = heads_to_bytes(&state.doc.heads());

        let _ = tx.send(ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            connection_id: connection_id.to_string(),
            document_key: self.key.to_string(),
            server_time: chrono::Utc::now().timestamp_millis(),
        });
        let _ = tx.send(ServerMessage::SyncStep2 { data: baseline });
        let _ = tx.send(ServerMessage::SyncStep1 { heads });
        for (other, data) in state.awareness.others(connection_id) {
            let _ = tx.send(ServerMessage::Awareness {
                connection_id: other,
                data,
            });
        }

        state.connections.insert(connection_id.to_string(), tx);
        state.touch();
        Ok(state.connections.len())
    }

    /// Leave the fan-out group. Returns the remaining count, or `None` if the
    /// connection was not attached.
    pub fn detach(&self, connection_id: &str) -> Option<usize> {
        let mut state = self.state.lock();
        state.connections.remove(connection_id)?;

        if state.awareness.remove(connection_id) {
            let msg = ServerMessage::AwarenessRemoved {
                connection_id: connection_id.to_string(),
            };
            state.broadcast(&self.key, connection_id, &msg);
        }
        state.touch();
        Some(state.connections.len())
    }

    /// Merge an update from `connection_id` and relay it verbatim to every
    /// other attached connection. A failed merge leaves the replica and the
    /// fan-out group untouched.
    pub fn apply_update(&self, connection_id: &str, data: Vec<u8>) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(connection_id) {
            return Err(SyncError::NotAttached(connection_id.to_string()));
        }

        state.doc.apply_update(&data)?;
        state.applied_gen += 1;
        state.touch();

        let msg = ServerMessage::Update {
            data,
            from: connection_id.to_string(),
        };
        state.broadcast(&self.key, connection_id, &msg);
        Ok(())
    }

    /// Store and relay an awareness payload. Never touches the document.
    pub fn publish_awareness(&self, connection_id: &str, data: Vec<u8>) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(connection_id) {
            return Err(SyncError::NotAttached(connection_id.to_string()));
        }

        state.awareness.update(connection_id, data.clone())?;
        let msg = ServerMessage::Awareness {
            connection_id: connection_id.to_string(),
            data,
        };
        state.broadcast(&self.key, connection_id, &msg);
        Ok(())
    }

    /// Everything a peer at `heads` is missing
    pub fn changes_since(&self, heads: &[[u8; 32]]) -> Vec<u8> {
        let mut state = self.state.lock();
        state.touch();
        state.doc.changes_since(&heads_from_bytes(heads))
    }

    pub fn touch(&self) {
        self.state.lock().touch();
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().is_dirty()
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_access.elapsed()
    }

    pub fn text(&self) -> String {
        self.state.lock().doc.text_mirror()
    }

    /// Full-state encoding for a durable write, if there is anything to write.
    pub fn persist_snapshot(&self) -> Option<PersistSnapshot> {
        let mut state = self.state.lock();
        if !state.is_dirty() {
            return None;
        }
        Some(PersistSnapshot {
            generation: state.applied_gen,
            binary_state: state.doc.save(),
            text_mirror: state.doc.text_mirror(),
        })
    }

    /// Record a successful write of `generation`.
    pub fn mark_persisted(&self, generation: u64) {
        let mut state = self.state.lock();
        state.persisted_gen = state.persisted_gen.max(generation);
    }

    /// Final eviction check: no connections and nothing left to write. On
    /// success the entry refuses all further attaches.
    pub fn try_mark_evicted(&self) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return true;
        }
        if !state.connections.is_empty() || state.is_dirty() {
            return false;
        }
        state.evicted = true;
        true
    }

    pub fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }
}
