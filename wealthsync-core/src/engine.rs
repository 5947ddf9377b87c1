/// Sync engine: outbound mutation ordering and inbound reconciliation
///
/// Single source of truth for the operation queue, the per-entity vector
/// clocks, the transport connection, and the conflict pipeline. The rest
/// of the application talks only to this type: mutations go in through
/// `queue_operation`, remote state comes back out through `SyncEvent`s.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{
    timestamp_fallback, ConflictAnalyzer, ConflictRegistry, ResolutionChoice, SuggestedResolution,
    SyncConflict,
};
use crate::error::{Error, Result};
use crate::operation::{EntityKind, OperationType, QueueItem, SyncOperation, SyncStatus};
use crate::queue::SyncQueue;
use crate::store::QueueStore;
use crate::transport::{Handshake, SyncTransport, TokenProvider, TransportEvent};
use crate::ClientId;

/// Events emitted by the engine. One tagged channel instead of
/// string-keyed callbacks, so consumers can match exhaustively.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    RemoteCreate {
        entity: EntityKind,
        entity_id: String,
        data: Value,
    },
    RemoteUpdate {
        entity: EntityKind,
        entity_id: String,
        data: Value,
    },
    RemoteDelete {
        entity: EntityKind,
        entity_id: String,
    },
    RemoteMerge {
        entity: EntityKind,
        entity_id: String,
        data: Value,
    },
    ConflictDetected {
        conflict: SyncConflict,
    },
    ConflictAutoResolved {
        conflict_id: String,
        resolution: ResolutionChoice,
    },
    SyncFailed {
        operation: SyncOperation,
        error: String,
    },
}

fn suggestion_to_choice(suggested: SuggestedResolution) -> Option<ResolutionChoice> {
    match suggested {
        SuggestedResolution::Client => Some(ResolutionChoice::Local),
        SuggestedResolution::Server => Some(ResolutionChoice::Remote),
        SuggestedResolution::Merge => Some(ResolutionChoice::Merge),
        SuggestedResolution::Manual => None,
    }
}

/// Main sync engine.
pub struct SyncEngine {
    client_id: ClientId,
    config: SyncConfig,
    queue: Arc<RwLock<SyncQueue>>,
    clocks: Arc<RwLock<crate::vector_clock::VectorClockTracker>>,
    conflicts: Arc<ConflictRegistry>,
    analyzer: Option<Arc<dyn ConflictAnalyzer>>,
    transport: Option<Arc<dyn SyncTransport>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    connected: Arc<AtomicBool>,
    syncing: Arc<AtomicBool>,
    last_sync_time: Arc<RwLock<Option<i64>>>,
    last_error: Arc<RwLock<Option<String>>>,
    event_tx: broadcast::Sender<SyncEvent>,
    flush_tx: mpsc::UnboundedSender<()>,
    flush_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<()>>>>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl SyncEngine {
    /// Create an engine over a queue store. The queue is loaded (and any
    /// corruption degraded to empty) before the engine is usable, so
    /// operations persisted by a previous process are visible
    /// immediately.
    pub fn new(client_id: ClientId, config: SyncConfig, store: Box<dyn QueueStore>) -> Self {
        let queue = SyncQueue::load(store);
        let (event_tx, _) = broadcast::channel(256);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        Self {
            client_id,
            config,
            queue: Arc::new(RwLock::new(queue)),
            clocks: Arc::new(RwLock::new(crate::vector_clock::VectorClockTracker::new())),
            conflicts: Arc::new(ConflictRegistry::new()),
            analyzer: None,
            transport: None,
            token_provider: None,
            connected: Arc::new(AtomicBool::new(false)),
            syncing: Arc::new(AtomicBool::new(false)),
            last_sync_time: Arc::new(RwLock::new(None)),
            last_error: Arc::new(RwLock::new(None)),
            event_tx,
            flush_tx,
            flush_rx: Arc::new(Mutex::new(Some(flush_rx))),
            shutdown_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ConflictAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn get_status(&self) -> SyncStatus {
        SyncStatus {
            is_connected: self.connected.load(Ordering::SeqCst),
            is_syncing: self.syncing.load(Ordering::SeqCst),
            last_sync_time: *self.last_sync_time.read(),
            pending_operations: self.queue.read().len(),
            pending_conflicts: self.conflicts.len(),
            error: self.last_error.read().clone(),
        }
    }

    pub fn get_conflicts(&self) -> Vec<SyncConflict> {
        self.conflicts.pending()
    }

    /// Max known version for an entity, if it has been seen.
    pub fn entity_version(&self, entity_id: &str) -> Option<u64> {
        self.clocks.read().get_version(entity_id)
    }

    fn broadcast_status(&self) {
        let _ = self.event_tx.send(SyncEvent::StatusChanged(self.get_status()));
    }

    /// Version for a freshly minted local operation: one past the max of
    /// the confirmed clock and anything still queued for the entity, so
    /// versions stay monotonic while earlier operations await their ack.
    fn next_local_version(&self, entity_id: &str) -> u64 {
        let confirmed = self.clocks.read().get_version(entity_id).unwrap_or(0);
        let queued = self.queue.read().max_pending_version(entity_id).unwrap_or(0);
        confirmed.max(queued) + 1
    }

    /// Record a local mutation for delivery. Synchronous: the operation
    /// is persisted in the queue before this returns. If connected and
    /// not already flushing, a flush is triggered immediately.
    pub fn queue_operation(
        &self,
        op_type: OperationType,
        entity: EntityKind,
        entity_id: &str,
        data: Value,
    ) -> Result<SyncOperation> {
        let version = self.next_local_version(entity_id);
        let operation = SyncOperation::new(
            op_type,
            entity,
            entity_id,
            data,
            self.client_id.clone(),
            version,
        );

        let item = QueueItem::new(operation.clone(), self.config.max_retries);
        self.queue.write().enqueue(item)?;
        debug!(
            operation_id = %operation.id,
            entity = %entity,
            entity_id,
            version,
            "operation queued"
        );
        self.broadcast_status();

        if self.connected.load(Ordering::SeqCst) && !self.syncing.load(Ordering::SeqCst) {
            let _ = self.flush_tx.send(());
        }

        Ok(operation)
    }

    /// Start the connection supervisor: connect with backoff, pump
    /// transport events, and flush on a periodic tick. With no endpoint
    /// configured this is a silent no-op and the engine stays in
    /// local-only mode.
    pub fn start(&self) {
        let (Some(_), Some(transport)) =
            (self.config.endpoint.as_ref(), self.transport.as_ref())
        else {
            debug!("no sync endpoint configured, running local-only");
            return;
        };

        let flush_rx = self.flush_rx.lock().take();
        let Some(flush_rx) = flush_rx else {
            warn!("sync engine already started");
            return;
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let engine = self.clone_for_task();
        let transport = transport.clone();
        tokio::spawn(async move {
            engine.run(transport, shutdown_rx, flush_rx).await;
        });
    }

    /// Single connection attempt without backoff, for hosts driving the
    /// engine manually. The supervisor started by `start` reconnects on
    /// its own.
    pub async fn connect(&self) -> Result<()> {
        if self.config.endpoint.is_none() {
            return Err(Error::NotConfigured);
        }
        let transport = self.transport.clone().ok_or(Error::NotConfigured)?;

        transport.connect(self.handshake()).await?;
        self.connected.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;
        self.broadcast_status();
        Ok(())
    }

    /// Explicit flush request. No-op while offline or disconnected.
    pub async fn force_sync(&self) {
        if self.config.endpoint.is_none() {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        self.process_sync_queue(&transport).await;
    }

    /// Drop all pending operations and persist the empty queue.
    pub fn clear_queue(&self) -> Result<()> {
        self.queue.write().clear()?;
        self.broadcast_status();
        Ok(())
    }

    /// Tear down the supervisor and the connection. In-flight sends are
    /// abandoned, not cancelled; the queue stays persisted.
    pub async fn disconnect(&self) {
        let shutdown = self.shutdown_tx.lock().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(()).await;
        }
        if let Some(transport) = &self.transport {
            let _ = transport.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.broadcast_status();
    }

    fn handshake(&self) -> Handshake {
        Handshake {
            client_id: self.client_id.clone(),
            auth_token: self.token_provider.as_ref().and_then(|p| p.token()),
        }
    }

    async fn run(
        self,
        transport: Arc<dyn SyncTransport>,
        mut shutdown_rx: mpsc::Receiver<()>,
        mut flush_rx: mpsc::UnboundedReceiver<()>,
    ) {
        let mut events = transport.events();

        if !self.connect_with_backoff(&transport).await {
            return;
        }

        let mut tick = interval(self.config.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("sync engine shutting down");
                    let _ = transport.disconnect().await;
                    self.connected.store(false, Ordering::SeqCst);
                    self.broadcast_status();
                    break;
                }
                _ = tick.tick() => {
                    if self.connected.load(Ordering::SeqCst) && !self.queue.read().is_empty() {
                        self.process_sync_queue(&transport).await;
                    }
                }
                _ = flush_rx.recv() => {
                    if self.connected.load(Ordering::SeqCst) {
                        self.process_sync_queue(&transport).await;
                    }
                }
                event = Self::next_event(&mut events) => {
                    match event {
                        Some(TransportEvent::RemoteOperation(operation)) => {
                            self.handle_remote_update(operation);
                        }
                        Some(TransportEvent::Disconnected { reason }) => {
                            warn!(?reason, "sync connection lost");
                            self.connected.store(false, Ordering::SeqCst);
                            self.broadcast_status();
                            if !self.connect_with_backoff(&transport).await {
                                break;
                            }
                        }
                        Some(TransportEvent::Connected) | None => {}
                    }
                }
            }
        }
    }

    async fn next_event(
        events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ) -> Option<TransportEvent> {
        match events {
            Some(rx) => {
                let event = rx.recv().await;
                if event.is_none() {
                    // Sender side gone; stop polling this arm.
                    *events = None;
                }
                event
            }
            None => std::future::pending().await,
        }
    }

    /// Connect with exponential backoff. Returns false once the attempt
    /// budget is exhausted; the engine then reports a persistent offline
    /// status and the queue keeps accruing.
    async fn connect_with_backoff(&self, transport: &Arc<dyn SyncTransport>) -> bool {
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            match transport.connect(self.handshake()).await {
                Ok(()) => {
                    info!(client_id = %self.client_id, "sync connection established");
                    self.connected.store(true, Ordering::SeqCst);
                    *self.last_error.write() = None;
                    self.broadcast_status();
                    // Drain anything that accumulated while offline.
                    self.process_sync_queue(transport).await;
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        error!(attempts = attempt, error = %e, "sync connection failed, giving up");
                        *self.last_error.write() = Some(format!("connection failed: {}", e));
                        self.connected.store(false, Ordering::SeqCst);
                        self.broadcast_status();
                        return false;
                    }
                    let delay = policy.delay(attempt - 1);
                    warn!(attempt, ?delay, error = %e, "sync connect failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    /// One flush pass: send up to `batch_size` queued operations in FIFO
    /// order, each with a per-send timeout. Guarded so that no two
    /// passes ever overlap; an enqueue arriving mid-pass is picked up by
    /// the next one.
    async fn process_sync_queue(&self, transport: &Arc<dyn SyncTransport>) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broadcast_status();

        let batch = self.queue.read().batch(self.config.batch_size);
        for item in batch {
            let operation = &item.operation;
            let outcome = match timeout(self.config.send_timeout, transport.send(operation)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::SendTimeout),
            };

            match outcome {
                Ok(ack) if ack.success => {
                    if let Err(e) = self.queue.write().remove(&operation.id) {
                        warn!(operation_id = %operation.id, error = %e, "failed to persist dequeue");
                    }
                    self.clocks.write().update(
                        &operation.entity_id,
                        operation.client_id.clone(),
                        operation.version,
                    );
                    debug!(operation_id = %operation.id, "operation acknowledged");
                }
                Ok(ack) => {
                    let reason = ack.error.unwrap_or_else(|| "rejected by server".to_string());
                    self.record_send_failure(&operation.id, reason);
                }
                Err(e) => {
                    self.record_send_failure(&operation.id, e.to_string());
                }
            }
        }

        self.syncing.store(false, Ordering::SeqCst);
        *self.last_sync_time.write() = Some(Utc::now().timestamp_millis());
        self.broadcast_status();
    }

    /// Bump an operation's retry count; once the budget is exhausted the
    /// operation is dropped and surfaced via `SyncFailed`, never lost
    /// silently.
    fn record_send_failure(&self, operation_id: &str, reason: String) {
        match self.queue.write().record_failure(operation_id) {
            Ok(Some(dropped)) => {
                warn!(
                    operation_id,
                    retries = dropped.retry_count,
                    reason = %reason,
                    "operation dropped after exhausting retries"
                );
                let _ = self.event_tx.send(SyncEvent::SyncFailed {
                    operation: dropped.operation,
                    error: reason,
                });
            }
            Ok(None) => {
                debug!(operation_id, reason = %reason, "send failed, will retry");
            }
            Err(e) => {
                error!(operation_id, error = %e, "failed to persist retry bookkeeping");
            }
        }
    }

    /// Inbound entry point for a server-pushed operation. A remote
    /// version that does not dominate the local clock is a conflict;
    /// anything newer applies cleanly and advances the clock.
    pub fn handle_remote_update(&self, operation: SyncOperation) {
        if self
            .clocks
            .read()
            .is_stale(&operation.entity_id, operation.version)
        {
            debug!(
                entity_id = %operation.entity_id,
                version = operation.version,
                "remote operation does not dominate local state, raising conflict"
            );
            self.raise_conflict(operation);
        } else {
            self.apply_remote(operation);
            self.broadcast_status();
        }
    }

    fn apply_remote(&self, operation: SyncOperation) {
        self.clocks.write().update(
            &operation.entity_id,
            operation.client_id.clone(),
            operation.version,
        );

        let event = match operation.op_type {
            OperationType::Create => SyncEvent::RemoteCreate {
                entity: operation.entity,
                entity_id: operation.entity_id,
                data: operation.data,
            },
            OperationType::Update => SyncEvent::RemoteUpdate {
                entity: operation.entity,
                entity_id: operation.entity_id,
                data: operation.data,
            },
            OperationType::Delete => SyncEvent::RemoteDelete {
                entity: operation.entity,
                entity_id: operation.entity_id,
            },
        };
        let _ = self.event_tx.send(event);
    }

    /// The local side of a conflict: the most recent queued intent for
    /// the entity if one exists, otherwise a synthesized stand-in at the
    /// locally confirmed version.
    ///
    /// The stand-in carries no payload and the epoch timestamp. There is
    /// no real local edit behind it, so it must lose every timestamp
    /// tie-break instead of inheriting a mint-time "now" that would beat
    /// any genuine remote edit.
    fn synthesize_local_operation(&self, remote: &SyncOperation) -> SyncOperation {
        if let Some(item) = self.queue.read().latest_for_entity(&remote.entity_id) {
            return item.operation.clone();
        }

        let version = self.clocks.read().get_version(&remote.entity_id).unwrap_or(0);
        let mut local = SyncOperation::new(
            OperationType::Update,
            remote.entity,
            remote.entity_id.clone(),
            Value::Null,
            self.client_id.clone(),
            version,
        );
        local.timestamp = 0;
        local
    }

    fn raise_conflict(&self, remote: SyncOperation) {
        let local = self.synthesize_local_operation(&remote);
        let conflict = SyncConflict::new(local, remote);
        let _ = self.event_tx.send(SyncEvent::ConflictDetected {
            conflict: conflict.clone(),
        });

        let analysis = match &self.analyzer {
            Some(analyzer) => analyzer.analyze(
                conflict.entity,
                &conflict.local_operation.data,
                &conflict.remote_operation.data,
                conflict.local_operation.timestamp,
                conflict.remote_operation.timestamp,
            ),
            None => timestamp_fallback(
                conflict.local_operation.timestamp,
                conflict.remote_operation.timestamp,
            ),
        };

        let policy = &self.config.conflict_policy;
        if analysis.can_auto_resolve && !policy.requires_user_intervention(&analysis) {
            if let Some(choice) = suggestion_to_choice(analysis.suggested) {
                match self.apply_resolution(&conflict, choice, analysis.merged_data.clone()) {
                    Ok(()) => {
                        debug!(conflict_id = %conflict.id, ?choice, "conflict auto-resolved");
                        let _ = self.event_tx.send(SyncEvent::ConflictAutoResolved {
                            conflict_id: conflict.id.clone(),
                            resolution: choice,
                        });
                        self.broadcast_status();
                        return;
                    }
                    Err(e) => {
                        warn!(conflict_id = %conflict.id, error = %e, "auto-resolution failed, surfacing conflict");
                    }
                }
            }
        }

        let conflict_id = self.conflicts.insert(conflict.clone());
        if policy.should_pre_apply(&analysis) {
            if let Some(choice) = suggestion_to_choice(analysis.suggested) {
                match self.apply_resolution(&conflict, choice, analysis.merged_data.clone()) {
                    Ok(()) => self.conflicts.record_suggestion(&conflict_id, analysis),
                    Err(e) => {
                        warn!(conflict_id = %conflict_id, error = %e, "could not pre-apply suggested resolution");
                    }
                }
            }
        }
        self.broadcast_status();
    }

    /// Resolve a pending conflict. A pre-applied suggestion confirmed
    /// with the same choice and the same (or no) payload is not applied
    /// a second time; a different payload re-applies with the caller's
    /// data.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ResolutionChoice,
        merged_data: Option<Value>,
    ) -> Result<()> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        let already_applied = match conflict.suggested.as_ref() {
            Some(analysis) => {
                suggestion_to_choice(analysis.suggested) == Some(choice)
                    && (merged_data.is_none() || merged_data == analysis.merged_data)
            }
            None => false,
        };
        if !already_applied {
            self.apply_resolution(&conflict, choice, merged_data)?;
        }

        self.conflicts.remove(conflict_id);
        self.broadcast_status();
        Ok(())
    }

    fn apply_resolution(
        &self,
        conflict: &SyncConflict,
        choice: ResolutionChoice,
        merged_data: Option<Value>,
    ) -> Result<()> {
        match choice {
            ResolutionChoice::Local => {
                let local = &conflict.local_operation;
                if local.data.is_null() {
                    // A synthesized stand-in has no payload to resend.
                    return Err(Error::InvalidArgument(
                        "no local operation to re-enqueue".to_string(),
                    ));
                }
                // Fight again: re-mint through the normal enqueue path so
                // the operation carries a fresh id and version. It may
                // re-conflict if the remote has moved further; bounded
                // retries make that acceptable.
                self.queue_operation(
                    local.op_type,
                    local.entity,
                    &local.entity_id,
                    local.data.clone(),
                )?;
            }
            ResolutionChoice::Remote => {
                self.apply_remote(conflict.remote_operation.clone());
            }
            ResolutionChoice::Merge => {
                let data = merged_data.ok_or_else(|| {
                    Error::InvalidArgument("merge resolution requires merged data".to_string())
                })?;
                let next = conflict
                    .local_operation
                    .version
                    .max(conflict.remote_operation.version)
                    + 1;
                self.clocks
                    .write()
                    .update(&conflict.entity_id, self.client_id.clone(), next);
                let _ = self.event_tx.send(SyncEvent::RemoteMerge {
                    entity: conflict.entity,
                    entity_id: conflict.entity_id.clone(),
                    data,
                });
            }
        }
        Ok(())
    }

    fn clone_for_task(&self) -> Self {
        Self {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            queue: self.queue.clone(),
            clocks: self.clocks.clone(),
            conflicts: self.conflicts.clone(),
            analyzer: self.analyzer.clone(),
            transport: self.transport.clone(),
            token_provider: self.token_provider.clone(),
            connected: self.connected.clone(),
            syncing: self.syncing.clone(),
            last_sync_time: self.last_sync_time.clone(),
            last_error: self.last_error.clone(),
            event_tx: self.event_tx.clone(),
            flush_tx: self.flush_tx.clone(),
            flush_rx: self.flush_rx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}
