use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::ManagedResource;
use crate::scheduler::PollPolicy;
use crate::util::{millis, secs};

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub api: ApiConfig,

    /// Where broken-resource alerts go (optional - defaults to the log)
    pub alerts: Option<AlertConfig>,

    /// Resources seeded into the store at startup
    #[serde(default)]
    pub resources: Vec<ManagedResource>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_failed_count")]
    pub max_failed_count: u32,

    #[serde(default = "default_broken_sleep_secs")]
    pub broken_sleep_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_failed_count: default_max_failed_count(),
            broken_sleep_secs: default_broken_sleep_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            enabled: self.enabled,
            batch_size: self.batch_size,
            max_failed_count: self.max_failed_count,
            broken_sleep: secs(self.broken_sleep_secs),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderConfig {
    pub resource_type: String,

    #[serde(default = "default_provider_interval_secs")]
    pub interval_secs: u64,

    /// The provider pushes its updates and is never polled
    #[serde(default)]
    pub push: bool,

    #[serde(default)]
    pub refresh: RefreshConfig,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RefreshConfig {
    #[default]
    Noop,

    Http {
        base_url: String,
        token: Option<String>,
        #[serde(default = "default_fetch_timeout_secs")]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub events: EventSourceConfig,

    #[serde(default)]
    pub snapshots: SnapshotSourceConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EventSourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Checkpoint name
    #[serde(default = "default_events_name")]
    pub name: String,

    #[serde(default = "default_events_name")]
    pub stream: String,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_late_buffer_secs")]
    pub late_buffer_secs: u64,

    #[serde(default = "default_events_quiet_ms")]
    pub quiet_ms: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_events_name(),
            stream: default_events_name(),
            window_secs: default_window_secs(),
            late_buffer_secs: default_late_buffer_secs(),
            quiet_ms: default_events_quiet_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            poll_delay_ms: default_poll_delay_ms(),
        }
    }
}

impl EventSourceConfig {
    pub fn window(&self) -> chrono::Duration {
        secs(self.window_secs)
    }

    pub fn late_buffer(&self) -> chrono::Duration {
        secs(self.late_buffer_secs)
    }

    pub fn quiet_duration(&self) -> chrono::Duration {
        millis(self.quiet_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SnapshotSourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_snapshots_name")]
    pub name: String,

    #[serde(default = "default_snapshots_name")]
    pub stream: String,

    /// Also the sampling period of snapshots
    #[serde(default = "default_snapshots_quiet_ms")]
    pub quiet_ms: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,

    pub batch_limit: Option<usize>,
}

impl Default for SnapshotSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_snapshots_name(),
            stream: default_snapshots_name(),
            quiet_ms: default_snapshots_quiet_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            poll_delay_ms: default_poll_delay_ms(),
            batch_limit: None,
        }
    }
}

impl SnapshotSourceConfig {
    pub fn quiet_duration(&self) -> chrono::Duration {
        millis(self.quiet_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PipelineConfig {
    /// Stage instances per granularity
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// How far the watermark trails the latest accepted event time
    #[serde(default = "default_lateness_ms")]
    pub lateness_ms: u64,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_channel_capacity")]
    pub broadcast_capacity: usize,

    #[serde(default = "default_persistence_batch_size")]
    pub persistence_batch_size: usize,

    #[serde(default = "default_persistence_flush_secs")]
    pub persistence_flush_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            lateness_ms: default_lateness_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            channel_capacity: default_channel_capacity(),
            broadcast_capacity: default_channel_capacity(),
            persistence_batch_size: default_persistence_batch_size(),
            persistence_flush_secs: default_persistence_flush_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn lateness(&self) -> chrono::Duration {
        millis(self.lateness_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn persistence_flush(&self) -> Duration {
        Duration::from_secs(self.persistence_flush_secs.max(1))
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database file holding resources, items, checkpoints and rollups
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (overridden by `ROLLWATCH_API_ADDR`)
    pub addr: Option<SocketAddr>,

    /// Bearer token required on every request except health checks
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertConfig {
    Log,
    Webhook { url: String },
}

fn default_true() -> bool {
    true
}

fn default_tick_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_workers() -> usize {
    8
}

fn default_max_failed_count() -> u32 {
    3
}

fn default_broken_sleep_secs() -> u64 {
    60 * 60
}

fn default_provider_interval_secs() -> u64 {
    5 * 60
}

fn default_events_name() -> String {
    "events".to_string()
}

fn default_snapshots_name() -> String {
    "snapshots".to_string()
}

fn default_window_secs() -> u64 {
    60 * 60
}

fn default_late_buffer_secs() -> u64 {
    60
}

fn default_events_quiet_ms() -> u64 {
    1_000
}

fn default_snapshots_quiet_ms() -> u64 {
    60_000
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_poll_delay_ms() -> u64 {
    10
}

fn default_partitions() -> usize {
    4
}

fn default_lateness_ms() -> u64 {
    2_000
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_persistence_batch_size() -> usize {
    100
}

fn default_persistence_flush_secs() -> u64 {
    5
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./rollwatch.db")
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
