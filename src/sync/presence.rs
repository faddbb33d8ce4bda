//! Awareness state for real-time collaboration.
//!
//! Awareness is the ephemeral, per-connection metadata a client publishes
//! about itself (cursor, selection, display name, color). The server treats
//! each payload as an opaque blob: it keeps the latest one per connection so
//! late joiners can be brought up to date, relays it to the other connections
//! on the same document, and forgets it when the connection detaches. It is
//! never merged into the document and never persisted.

use std::collections::HashMap;

use super::ConnectionId;

/// Largest awareness payload accepted from a client
pub const MAX_AWARENESS_BYTES: usize = 64 * 1024;

/// Latest awareness payload published by one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessState {
    pub data: Vec<u8>,
    /// Incremented on every publish from the same connection
    pub clock: u64,
    /// Timestamp of last update (milliseconds since epoch)
    pub updated_at_ms: i64,
}

/// Awareness states of the connections attached to one document.
///
/// Owned by the document's replica entry and mutated under its lock, so it
/// needs no synchronization of its own.
#[derive(Debug, Default)]
pub struct DocumentAwareness {
    states: HashMap<ConnectionId, AwarenessState>,
}

impl DocumentAwareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest payload for `connection_id`.
    pub fn update(&mut self, connection_id: &str, data: Vec<u8>) -> Result<u64, PresenceError> {
        if data.len() > MAX_AWARENESS_BYTES {
            return Err(PresenceError::TooLarge(data.len()));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let state = self
            .states
            .entry(connection_id.to_string())
            .or_insert_with(|| AwarenessState {
                data: Vec::new(),
                clock: 0,
                updated_at_ms: now,
            });
        state.data = data;
        state.clock += 1;
        state.updated_at_ms = now;

        Ok(state.clock)
    }

    /// Forget a connection. Returns true if it had published anything.
    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.states.remove(connection_id).is_some()
    }

    #[cfg(test)]
    pub fn get(&self, connection_id: &str) -> Option<&AwarenessState> {
        self.states.get(connection_id)
    }

    /// Every state except the one owned by `connection_id`
    pub fn others(&self, connection_id: &str) -> Vec<(ConnectionId, Vec<u8>)> {
        self.states
            .iter()
            .filter(|(id, _)| id.as_str() != connection_id)
            .map(|(id, state)| (id.clone(), state.data.clone()))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Errors related to awareness updates
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Awareness payload too large: {0} bytes (max: {})", MAX_AWARENESS_BYTES)]
    TooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_replaces_previous_state() {
        let mut awareness = DocumentAwareness::new();

        assert_eq!(awareness.update("conn-1", b"cursor:1".to_vec()).unwrap(), 1);
        assert_eq!(awareness.update("conn-1", b"cursor:9".to_vec()).unwrap(), 2);

        let state = awareness.get("conn-1").unwrap();
        assert_eq!(state.data, b"cursor:9");
        assert_eq!(state.clock, 2);
        assert_eq!(awareness.len(), 1);
    }

    #[test]
    fn test_others_excludes_self() {
        let mut awareness = DocumentAwareness::new();
        awareness.update("conn-1", b"alice".to_vec()).unwrap();
        awareness.update("conn-2", b"bob".to_vec()).unwrap();

        let others = awareness.others("conn-1");
        assert_eq!(others, vec![("conn-2".to_string(), b"bob".to_vec())]);
    }

    #[test]
    fn test_remove() {
        let mut awareness = DocumentAwareness::new();
        awareness.update("conn-1", b"alice".to_vec()).unwrap();

        assert!(awareness.remove("conn-1"));
        assert!(!awareness.remove("conn-1"));
        assert!(awareness.is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut awareness = DocumentAwareness::new();
        let result = awareness.update("conn-1", vec![0; MAX_AWARENESS_BYTES + 1]);

        assert!(matches!(result, Err(PresenceError::TooLarge(_))));
        assert!(awareness.is_empty());
    }
}
