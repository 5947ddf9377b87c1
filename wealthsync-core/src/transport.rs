/// Transport boundary for the sync backend
///
/// One authenticated bidirectional connection, modeled as a socket-style
/// abstraction: connect with a handshake, send with a per-message ack,
/// subscribe to server-pushed events, disconnect. Reconnection policy
/// lives in `BackoffPolicy` so it can be exercised without real timers.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::operation::SyncOperation;
use crate::ClientId;

/// Connect-time handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub client_id: ClientId,
    pub auth_token: Option<String>,
}

/// Message-level acknowledgement for one operation send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    pub success: bool,
    pub error: Option<String>,
}

impl SendAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Events pushed by the transport to the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    RemoteOperation(SyncOperation),
}

/// Auth token source, consulted only at connect time.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Fixed token, or none for unauthenticated backends.
pub struct StaticTokenProvider(Option<String>);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Trait for sync transport implementations.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Open the connection and perform the authenticated handshake.
    async fn connect(&self, handshake: Handshake) -> Result<()>;

    /// Send one operation and wait for the server acknowledgement.
    async fn send(&self, operation: &SyncOperation) -> Result<SendAck>;

    /// Take the server-push event stream. Yields the receiver once;
    /// subsequent calls return None.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Exponential reconnect backoff: bounded attempts, growing delay,
/// capped. Delay computation is pure so tests need no timers.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum reconnect attempts before giving up and reporting a
    /// persistent offline status.
    pub max_attempts: u32,
    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// Default used for reconnecting to a sync backend.
    pub fn standard() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }

    /// Short delays for tests and local backends.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
        }
    }

    /// Delay before the given attempt (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32))
            .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Scriptable in-memory transport for tests and hosts without a backend.
///
/// Connect results and acks can be scripted; unscripted calls succeed.
/// Remote pushes are injected with `push_remote`, and `sent` exposes
/// everything the engine delivered.
pub struct MockTransport {
    connected: AtomicBool,
    /// Scripted connect outcomes, consumed front to back.
    connect_script: Mutex<VecDeque<std::result::Result<(), String>>>,
    /// Scripted acks, consumed front to back.
    ack_script: Mutex<VecDeque<SendAck>>,
    /// When set, every unscripted send is acked as a failure.
    fail_all_sends: AtomicBool,
    send_delay: RwLock<Option<Duration>>,
    sent: Mutex<Vec<SyncOperation>>,
    handshakes: Mutex<Vec<Handshake>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            connect_script: Mutex::new(VecDeque::new()),
            ack_script: Mutex::new(VecDeque::new()),
            fail_all_sends: AtomicBool::new(false),
            send_delay: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn script_connect_failures(&self, n: usize) {
        let mut script = self.connect_script.lock();
        for _ in 0..n {
            script.push_back(Err("connection refused".to_string()));
        }
    }

    /// Script the ack for the next unscripted send.
    pub fn script_ack(&self, ack: SendAck) {
        self.ack_script.lock().push_back(ack);
    }

    pub fn set_fail_all_sends(&self, fail: bool) {
        self.fail_all_sends.store(fail, Ordering::SeqCst);
    }

    /// Delay each send, to widen the window for interleaving tests.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.write() = Some(delay);
    }

    /// Inject a server-pushed remote operation.
    pub fn push_remote(&self, operation: SyncOperation) {
        let _ = self
            .event_tx
            .send(TransportEvent::RemoteOperation(operation));
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(TransportEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
    }

    pub fn sent(&self) -> Vec<SyncOperation> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().clone()
    }

    /// Peak number of concurrently outstanding sends.
    pub fn max_concurrent_sends(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn connect(&self, handshake: Handshake) -> Result<()> {
        self.handshakes.lock().push(handshake);

        if let Some(outcome) = self.connect_script.lock().pop_front() {
            if let Err(reason) = outcome {
                return Err(Error::Transport(reason));
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, operation: &SyncOperation) -> Result<SendAck> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.send_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.sent.lock().push(operation.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(ack) = self.ack_script.lock().pop_front() {
            return Ok(ack);
        }
        if self.fail_all_sends.load(Ordering::SeqCst) {
            return Ok(SendAck::failed("scripted failure"));
        }
        Ok(SendAck::ok())
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.lock().take()
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
