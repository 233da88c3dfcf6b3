//! Session, awareness and persistence tuning.

use quire_doc::EngineConfig;
use std::time::Duration;

/// Configuration shared by clients, the hub and the registry.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Updates per catch-up or flush chunk.
    pub chunk_size: usize,
    /// Bytes per snapshot chunk.
    pub snapshot_chunk_bytes: usize,
    /// Awareness heartbeat period (in milliseconds).
    pub heartbeat_interval_ms: u64,
    /// Heartbeats a peer may miss before its awareness entry is dropped.
    pub missed_heartbeats: u32,
    /// How long to wait for the peer's hello (in milliseconds).
    pub handshake_timeout_ms: u64,
    /// How long a flushed chunk may wait for its acknowledgement.
    pub ack_timeout_ms: u64,
    /// First reconnect delay (in milliseconds).
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap (in milliseconds).
    pub reconnect_max_ms: u64,
    /// Bound on remote updates queued for missing dependencies.
    pub max_pending_updates: usize,
    /// How long a queued update may wait (in milliseconds).
    pub dependency_timeout_ms: u64,
    /// Idle time before the registry evicts a document (in milliseconds).
    pub idle_evict_ms: u64,
    /// Period of the hub's persistence flush (in milliseconds).
    pub persist_interval_ms: u64,
    /// Attempts per snapshot save.
    pub persist_retries: u32,
    pub persist_retry_base_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            snapshot_chunk_bytes: 16 * 1024,
            heartbeat_interval_ms: 5000,
            missed_heartbeats: 3,
            handshake_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            reconnect_base_ms: 250,
            reconnect_max_ms: 30_000,
            max_pending_updates: 1024,
            dependency_timeout_ms: 30_000,
            idle_evict_ms: 60_000,
            persist_interval_ms: 5000,
            persist_retries: 3,
            persist_retry_base_ms: 100,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Never zero; tokio intervals reject an empty period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Age after which a silent peer's awareness entry is stale.
    pub fn awareness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats.max(1)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn idle_evict(&self) -> Duration {
        Duration::from_millis(self.idle_evict_ms)
    }

    /// Never zero, like [`Self::heartbeat_interval`].
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms.max(1))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_pending: self.max_pending_updates,
            dependency_timeout: Duration::from_millis(self.dependency_timeout_ms),
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size.max(1);
        self
    }

    pub fn snapshot_chunk_bytes(mut self, bytes: usize) -> Self {
        self.config.snapshot_chunk_bytes = bytes.max(1);
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms.max(1);
        self
    }

    pub fn missed_heartbeats(mut self, count: u32) -> Self {
        self.config.missed_heartbeats = count;
        self
    }

    pub fn handshake_timeout(mut self, ms: u64) -> Self {
        self.config.handshake_timeout_ms = ms;
        self
    }

    pub fn ack_timeout(mut self, ms: u64) -> Self {
        self.config.ack_timeout_ms = ms;
        self
    }

    pub fn reconnect(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.reconnect_base_ms = base_ms;
        self.config.reconnect_max_ms = max_ms.max(base_ms);
        self
    }

    pub fn max_pending_updates(mut self, max: usize) -> Self {
        self.config.max_pending_updates = max;
        self
    }

    pub fn dependency_timeout(mut self, ms: u64) -> Self {
        self.config.dependency_timeout_ms = ms;
        self
    }

    pub fn idle_evict(mut self, ms: u64) -> Self {
        self.config.idle_evict_ms = ms;
        self
    }

    pub fn persist_interval(mut self, ms: u64) -> Self {
        self.config.persist_interval_ms = ms.max(1);
        self
    }

    pub fn persist_retries(mut self, attempts: u32, base_ms: u64) -> Self {
        self.config.persist_retries = attempts.max(1);
        self.config.persist_retry_base_ms = base_ms;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
