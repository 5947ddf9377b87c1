/// Shared helpers for wealthsync integration tests

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use wealthsync_core::{
    BackoffPolicy, ClientId, ConflictAnalysis, ConflictAnalyzer, EntityKind, MemoryStore,
    MockTransport, OperationType, SyncConfig, SyncEngine, SyncEngineBuilder, SyncEvent,
    SyncOperation,
};

pub const TEST_ENDPOINT: &str = "wss://sync.test.invalid";

/// Config with real but short timings so integration tests stay fast.
pub fn fast_config() -> SyncConfig {
    SyncConfig::new()
        .with_endpoint(TEST_ENDPOINT)
        .with_flush_interval(Duration::from_millis(20))
        .with_send_timeout(Duration::from_millis(500))
        .with_reconnect_policy(BackoffPolicy::fast())
}

/// Engine wired to a mock transport over an in-memory store.
pub fn online_engine(transport: Arc<MockTransport>) -> SyncEngine {
    SyncEngineBuilder::new()
        .client_id(ClientId::from("local"))
        .config(fast_config())
        .store(Box::new(MemoryStore::new()))
        .transport(transport)
        .build()
}

/// A server-pushed operation from another device.
pub fn remote_op(
    entity: EntityKind,
    entity_id: &str,
    version: u64,
    client: &str,
    data: Value,
) -> SyncOperation {
    SyncOperation::new(
        OperationType::Update,
        entity,
        entity_id,
        data,
        ClientId::from(client),
        version,
    )
}

/// Poll a condition with a deadline, yielding between polls so engine
/// tasks make progress.
pub async fn wait_until(deadline: Duration, f: impl Fn() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f()
}

/// Collect everything currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Analyzer that refuses to recommend anything.
pub struct ManualAnalyzer;

impl ConflictAnalyzer for ManualAnalyzer {
    fn analyze(
        &self,
        _entity: EntityKind,
        _local: &Value,
        _remote: &Value,
        _local_timestamp: i64,
        _remote_timestamp: i64,
    ) -> ConflictAnalysis {
        ConflictAnalysis::manual()
    }
}

/// Analyzer that returns a fixed, preconfigured analysis.
pub struct ScriptedAnalyzer(pub ConflictAnalysis);

impl ConflictAnalyzer for ScriptedAnalyzer {
    fn analyze(
        &self,
        _entity: EntityKind,
        _local: &Value,
        _remote: &Value,
        _local_timestamp: i64,
        _remote_timestamp: i64,
    ) -> ConflictAnalysis {
        self.0.clone()
    }
}
