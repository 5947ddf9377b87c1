/// Sync engine configuration

use std::time::Duration;

use crate::conflict::ConflictPolicy;
use crate::transport::BackoffPolicy;

/// Operational parameters for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sync backend endpoint. None means the transport is never started
    /// and the engine runs in permanent offline/local-only mode.
    pub endpoint: Option<String>,

    /// Maximum operations in flight per flush pass.
    pub batch_size: usize,

    /// Failed sends allowed per operation before it is dropped and
    /// reported.
    pub max_retries: u32,

    /// Per-operation ack timeout; a timeout counts as a failed send.
    pub send_timeout: Duration,

    /// Periodic flush interval while idle, connected, and non-empty.
    pub flush_interval: Duration,

    /// Connection-level reconnect backoff.
    pub reconnect: BackoffPolicy,

    /// Thresholds gating conflict auto-resolution.
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_size: 10,
            max_retries: 3,
            send_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(5),
            reconnect: BackoffPolicy::standard(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sync backend endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the per-flush batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the per-operation retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-operation ack timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the idle flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the reconnect backoff policy.
    pub fn with_reconnect_policy(mut self, policy: BackoffPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the conflict resolution policy thresholds.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}
