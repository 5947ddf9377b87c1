/// Sync operation and queue item types
///
/// A `SyncOperation` is one atomic, replayable intent to mutate a single
/// domain entity. A `QueueItem` wraps it with delivery bookkeeping.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::ClientId;

/// Domain record kinds subject to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Transaction,
    Account,
    Budget,
    Goal,
    Category,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Transaction => "transaction",
            EntityKind::Account => "account",
            EntityKind::Budget => "budget",
            EntityKind::Goal => "goal",
            EntityKind::Category => "category",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of mutation carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// An atomic, replayable intent to mutate one entity.
///
/// `version` is monotonically increasing per entity as observed by the
/// local vector clock; it is not globally unique across clients. Two
/// clients independently producing the same version for the same entity
/// is exactly the condition that defines a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique identifier, generated client-side.
    pub id: String,
    /// Mutation kind.
    pub op_type: OperationType,
    /// Domain record kind.
    pub entity: EntityKind,
    /// Identifier of the affected record, stable across devices.
    pub entity_id: String,
    /// Opaque payload: the entity's field set at time of mutation.
    pub data: Value,
    /// Client wall-clock at creation. Tie-break heuristic only, never a
    /// source of truth.
    pub timestamp: i64,
    /// Stable per-installation identifier.
    pub client_id: ClientId,
    /// Next local version for `entity_id` at mint time.
    pub version: u64,
}

impl SyncOperation {
    pub fn new(
        op_type: OperationType,
        entity: EntityKind,
        entity_id: impl Into<String>,
        data: Value,
        client_id: ClientId,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op_type,
            entity,
            entity_id: entity_id.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
            client_id,
            version,
        }
    }
}

/// A queued operation with delivery bookkeeping.
///
/// Lifecycle: created on enqueue, `retry_count` bumped on each failed
/// send, removed on ack, removed-with-failure-event once `retry_count`
/// exceeds `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub operation: SyncOperation,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueueItem {
    pub fn new(operation: SyncOperation, max_retries: u32) -> Self {
        Self {
            operation,
            retry_count: 0,
            max_retries,
        }
    }

    /// Record a failed send attempt.
    pub fn mark_retry(&mut self) {
        self.retry_count += 1;
    }

    /// True once the item has used up its initial attempt plus
    /// `max_retries` retries.
    pub fn exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

/// Observable, derived, process-wide sync state.
///
/// Recomputed and broadcast after every state transition: connect,
/// disconnect, enqueue, dequeue, conflict raised or resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_connected: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<i64>,
    /// Queue length.
    pub pending_operations: usize,
    /// Number of unresolved conflicts (full list via `get_conflicts`).
    pub pending_conflicts: usize,
    pub error: Option<String>,
}
