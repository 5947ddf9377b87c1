/// Durable persistence for the sync queue
///
/// The queue file is the sole durable record of operations not yet
/// confirmed by the server. Loads are defensive: malformed or missing
/// data yields an empty queue with a logged warning, never an error.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::operation::QueueItem;

/// Storage boundary for the pending-operation queue.
pub trait QueueStore: Send + Sync {
    /// Load the persisted queue. Implementations must tolerate missing
    /// or malformed data by returning an empty queue.
    fn load(&self) -> Result<Vec<QueueItem>>;

    /// Persist the full queue. Called synchronously on every queue
    /// mutation, before the mutation is considered committed.
    fn save(&self, items: &[QueueItem]) -> Result<()>;
}

impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    fn load(&self) -> Result<Vec<QueueItem>> {
        (**self).load()
    }

    fn save(&self, items: &[QueueItem]) -> Result<()> {
        (**self).save(items)
    }
}

/// JSON-on-disk queue store.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl QueueStore for JsonFileStore {
    fn load(&self) -> Result<Vec<QueueItem>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read sync queue, starting empty");
                return Ok(Vec::new());
            }
        };

        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt sync queue, starting empty");
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, items: &[QueueItem]) -> Result<()> {
        let json = serde_json::to_string(items)?;
        // Write-then-rename so a crash mid-write never leaves a corrupt
        // queue file behind.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory queue store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<Vec<QueueItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryStore {
    fn load(&self) -> Result<Vec<QueueItem>> {
        Ok(self.items.read().clone())
    }

    fn save(&self, items: &[QueueItem]) -> Result<()> {
        *self.items.write() = items.to_vec();
        Ok(())
    }
}
