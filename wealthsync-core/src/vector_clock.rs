/// Per-entity version tracking
///
/// One clock per entity, mapping client ids to the last version confirmed
/// from that client. Staleness is decided by comparing against the max
/// version across all clients; this is deliberately weaker than full
/// causal vector clocks. The conflict heuristics are designed around the
/// simpler semantics, so do not upgrade this to a causal merge.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ClientId;

/// Last-confirmed version per client for a single entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityClock {
    entries: HashMap<ClientId, u64>,
}

impl EntityClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version last confirmed from a specific client (0 if unseen).
    pub fn get(&self, client_id: &ClientId) -> u64 {
        self.entries.get(client_id).copied().unwrap_or(0)
    }

    /// Record the last-seen version from a client. Overwrite is
    /// intentional: this is "what that client has confirmed", not a
    /// causal history, so no max-merge happens here.
    pub fn update(&mut self, client_id: ClientId, version: u64) {
        self.entries.insert(client_id, version);
    }

    /// Max version across all clients that have touched this entity.
    pub fn max_version(&self) -> Option<u64> {
        self.entries.values().copied().max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All client ids present in this clock.
    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.entries.keys()
    }
}

/// Tracks one `EntityClock` per entity id.
#[derive(Debug, Clone, Default)]
pub struct VectorClockTracker {
    clocks: HashMap<String, EntityClock>,
}

impl VectorClockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Max version across all known clients for the entity, or None if
    /// the entity has never been seen.
    pub fn get_version(&self, entity_id: &str) -> Option<u64> {
        self.clocks.get(entity_id).and_then(|c| c.max_version())
    }

    /// Version to assign to a freshly minted local operation, based on
    /// confirmed versions only. Callers that also hold unacknowledged
    /// queued operations must take those into account themselves.
    pub fn next_version(&self, entity_id: &str) -> u64 {
        self.get_version(entity_id).unwrap_or(0) + 1
    }

    /// Last-confirmed version from a specific client for an entity.
    pub fn client_version(&self, entity_id: &str, client_id: &ClientId) -> u64 {
        self.clocks
            .get(entity_id)
            .map(|c| c.get(client_id))
            .unwrap_or(0)
    }

    /// Record the version confirmed from a client for an entity.
    pub fn update(&mut self, entity_id: &str, client_id: ClientId, version: u64) {
        self.clocks
            .entry(entity_id.to_string())
            .or_default()
            .update(client_id, version);
    }

    /// True if an incoming operation at `version` does not dominate the
    /// local state for the entity.
    pub fn is_stale(&self, entity_id: &str, version: u64) -> bool {
        matches!(self.get_version(entity_id), Some(local) if local >= version)
    }

    pub fn entity_clock(&self, entity_id: &str) -> Option<&EntityClock> {
        self.clocks.get(entity_id)
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}
