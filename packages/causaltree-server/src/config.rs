//! Configuration management.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::telemetry::LoggingConfig;

/// Main server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Per-branch actor configuration
    #[serde(default)]
    pub branch: BranchConfig,

    /// Stage persistence worker configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Object/stage storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address the line-delimited JSON listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Outbound queue depth per connected session
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            session_capacity: default_session_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchConfig {
    /// Inbound command queue depth per branch actor
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// Outbound queue depth per watcher before it is marked lagged
    #[serde(default = "default_watcher_capacity")]
    pub watcher_capacity: usize,

    /// Maximum atoms buffered while waiting for their cause
    #[serde(default = "default_pending_max_atoms")]
    pub pending_max_atoms: usize,

    /// How long a buffered atom may wait for its cause
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,

    /// Interval of the maintenance tick (pending expiry, lagged watcher resync)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// A branch with no watchers for this long is evicted by `evict_idle`
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            watcher_capacity: default_watcher_capacity(),
            pending_max_atoms: default_pending_max_atoms(),
            pending_timeout_ms: default_pending_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl BranchConfig {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Stage writes queued per branch before the actor holds them in its backlog
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures before an operational alert is raised
    #[serde(default = "default_alert_after")]
    pub alert_after: u32,

    /// How long eviction waits for queued writes to drain
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            alert_after: default_alert_after(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl PersistenceConfig {
    /// `base * 2^attempt`, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file for the sqlite backend
    pub path: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:4410".to_string()
}

fn default_session_capacity() -> usize {
    256
}

fn default_inbox_capacity() -> usize {
    256
}

fn default_watcher_capacity() -> usize {
    128
}

fn default_pending_max_atoms() -> usize {
    1024
}

fn default_pending_timeout_ms() -> u64 {
    30_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_alert_after() -> u32 {
    5
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

impl ServerConfig {
    /// Load configuration from `CAUSALTREE__*` environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CAUSALTREE").separator("__"))
            .build()?;

        let cfg: ServerConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load configuration from a file, with environment overrides on top.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CAUSALTREE").separator("__"))
            .build()?;

        let cfg: ServerConfig = config.try_deserialize()?;
        Ok(cfg)
    }
}
