/// WealthSync core: offline-first sync for personal finance data
///
/// Client-side sync engine built around a durable operation queue,
/// simplified per-entity vector clocks, and a pluggable conflict
/// analysis pipeline. Designed to run entirely offline: with no
/// endpoint configured the queue still accepts and persists operations,
/// and the transport is never started.
///
/// # Example
///
/// ```no_run
/// use wealthsync_core::{
///     EntityKind, OperationType, SyncConfig, SyncEngineBuilder,
/// };
/// use wealthsync_core::store::JsonFileStore;
/// use serde_json::json;
///
/// # fn main() -> wealthsync_core::Result<()> {
/// let engine = SyncEngineBuilder::new()
///     .config(SyncConfig::new().with_endpoint("wss://sync.example.com"))
///     .store(Box::new(JsonFileStore::new("sync-queue.json")))
///     .build();
///
/// engine.queue_operation(
///     OperationType::Create,
///     EntityKind::Transaction,
///     "txn-1",
///     json!({"amount": -42.50, "category": "groceries"}),
/// )?;
/// # Ok(())
/// # }
/// ```

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod operation;
pub mod queue;
pub mod store;
pub mod transport;
pub mod vector_clock;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub use config::SyncConfig;
pub use conflict::{
    ConflictAnalysis, ConflictAnalyzer, ConflictPolicy, FieldMergeAnalyzer, ResolutionChoice,
    SuggestedResolution, SyncConflict,
};
pub use engine::{SyncEngine, SyncEvent};
pub use error::{Error, Result};
pub use operation::{EntityKind, OperationType, QueueItem, SyncOperation, SyncStatus};
pub use store::{JsonFileStore, MemoryStore, QueueStore};
pub use transport::{
    BackoffPolicy, Handshake, MockTransport, SendAck, StaticTokenProvider, SyncTransport,
    TokenProvider, TransportEvent,
};
pub use vector_clock::{EntityClock, VectorClockTracker};

/// Stable identity of this sync client. One per device installation;
/// every operation a client mints carries its id, and vector clock
/// entries are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Generate a fresh random client id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Load the client id persisted at `path`, or generate one and
    /// persist it. Identity must survive restarts or every relaunch
    /// would look like a new device to the clock.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let id = contents.trim();
                if !id.is_empty() {
                    return Ok(Self(id.to_string()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let id = Self::new();
        std::fs::write(path, &id.0)?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builder for [`SyncEngine`].
///
/// Only the queue store is required; everything else defaults to an
/// offline engine with a random client id and no analyzer.
pub struct SyncEngineBuilder {
    client_id: Option<ClientId>,
    config: SyncConfig,
    store: Option<Box<dyn QueueStore>>,
    transport: Option<Arc<dyn SyncTransport>>,
    analyzer: Option<Arc<dyn ConflictAnalyzer>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            client_id: None,
            config: SyncConfig::default(),
            store: None,
            transport: None,
            analyzer: None,
            token_provider: None,
        }
    }

    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Box<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn ConflictAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Build the engine. Falls back to an in-memory store when none was
    /// provided; real applications should persist the queue.
    pub fn build(self) -> SyncEngine {
        let client_id = self.client_id.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Box::new(MemoryStore::new()));

        let mut engine = SyncEngine::new(client_id, self.config, store);
        if let Some(transport) = self.transport {
            engine = engine.with_transport(transport);
        }
        if let Some(analyzer) = self.analyzer {
            engine = engine.with_analyzer(analyzer);
        }
        if let Some(provider) = self.token_provider {
            engine = engine.with_token_provider(provider);
        }
        engine
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
