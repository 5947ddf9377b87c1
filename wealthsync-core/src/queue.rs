/// Pending-operation queue with synchronous persistence
///
/// The in-memory queue mirrors the durable store at all times: every
/// mutation persists before returning, so a crash between an in-memory
/// change and the write can never leave the two inconsistent for longer
/// than one synchronous call.

use std::collections::VecDeque;
use tracing::warn;

use crate::error::Result;
use crate::operation::QueueItem;
use crate::store::QueueStore;

pub struct SyncQueue {
    items: VecDeque<QueueItem>,
    store: Box<dyn QueueStore>,
}

impl SyncQueue {
    /// Load the queue from the store. Failures degrade to an empty
    /// queue; unsynced work is preferable to a crash on startup.
    pub fn load(store: Box<dyn QueueStore>) -> Self {
        let items = match store.load() {
            Ok(items) => items.into(),
            Err(e) => {
                warn!(error = %e, "failed to load sync queue, starting empty");
                VecDeque::new()
            }
        };
        Self { items, store }
    }

    fn persist(&self) -> Result<()> {
        let snapshot: Vec<QueueItem> = self.items.iter().cloned().collect();
        self.store.save(&snapshot)
    }

    /// Append an item and persist.
    pub fn enqueue(&mut self, item: QueueItem) -> Result<()> {
        self.items.push_back(item);
        self.persist()
    }

    /// Remove an acknowledged item by operation id and persist.
    pub fn remove(&mut self, operation_id: &str) -> Result<Option<QueueItem>> {
        let position = self
            .items
            .iter()
            .position(|i| i.operation.id == operation_id);

        let removed = position.and_then(|p| self.items.remove(p));
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Record a failed send for an item.
    ///
    /// The item moves to the back of the queue for its next attempt, so
    /// cross-entity ordering across retries is best-effort. Returns the
    /// item if it exhausted its retries and was dropped.
    pub fn record_failure(&mut self, operation_id: &str) -> Result<Option<QueueItem>> {
        let position = self
            .items
            .iter()
            .position(|i| i.operation.id == operation_id);

        let Some(mut item) = position.and_then(|p| self.items.remove(p)) else {
            return Ok(None);
        };
        item.mark_retry();

        let dropped = if item.exhausted() {
            Some(item)
        } else {
            self.items.push_back(item);
            None
        };

        self.persist()?;
        Ok(dropped)
    }

    /// Snapshot of the first `n` items in FIFO order.
    pub fn batch(&self, n: usize) -> Vec<QueueItem> {
        self.items.iter().take(n).cloned().collect()
    }

    /// Highest version still queued for an entity, if any. Needed so
    /// freshly minted versions stay monotonic while earlier operations
    /// for the same entity are awaiting acknowledgement.
    pub fn max_pending_version(&self, entity_id: &str) -> Option<u64> {
        self.items
            .iter()
            .filter(|i| i.operation.entity_id == entity_id)
            .map(|i| i.operation.version)
            .max()
    }

    /// Most recent queued local intent for an entity.
    pub fn latest_for_entity(&self, entity_id: &str) -> Option<&QueueItem> {
        self.items
            .iter()
            .rev()
            .find(|i| i.operation.entity_id == entity_id)
    }

    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything and persist the empty queue.
    pub fn clear(&mut self) -> Result<()> {
        self.items.clear();
        self.persist()
    }
}
