//! Sync configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use chainsync_core::config::SyncConfig;
//!
//! let config = SyncConfig::builder()
//!     .network_id("ethereum")
//!     .start_height(19_000_000)
//!     .window_size(256)
//!     .build();
//! assert_eq!(config.start_height, Some(19_000_000));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Aggregate id of the network when none is configured.
pub const DEFAULT_NETWORK_ID: &str = "network";

/// Backoff settings for saga actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Cap on exponential growth.
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Configuration for a sync engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Aggregate id of the network state in the event store.
    pub network_id: String,
    /// Operator-configured first block to ingest. `None` = follow the tip.
    pub start_height: Option<u64>,
    /// Highest block the engine accepts. `None` = unbounded.
    pub max_block_height: Option<u64>,
    /// Number of recent blocks the network retains for fork walks.
    pub window_size: usize,
    /// Capacity of the domain event bus.
    pub event_channel_capacity: usize,
    /// Snapshot an aggregate every this many events. `0` disables snapshots.
    pub snapshot_interval: u64,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network_id: DEFAULT_NETWORK_ID.into(),
            start_height: None,
            max_block_height: None,
            window_size: 1000,
            event_channel_capacity: 1024,
            snapshot_interval: 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Read overrides from `CHAINSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SyncConfig::from_env`] but with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(id) = get("CHAINSYNC_NETWORK_ID") {
            config.network_id = id;
        }
        if let Some(v) = get("CHAINSYNC_START_BLOCK_HEIGHT") {
            config.start_height = Some(parse_number("CHAINSYNC_START_BLOCK_HEIGHT", &v)?);
        }
        if let Some(v) = get("CHAINSYNC_MAX_BLOCK_HEIGHT") {
            config.max_block_height = Some(parse_number("CHAINSYNC_MAX_BLOCK_HEIGHT", &v)?);
        }
        if let Some(v) = get("CHAINSYNC_WINDOW_SIZE") {
            config.window_size = parse_number("CHAINSYNC_WINDOW_SIZE", &v)? as usize;
        }
        if let Some(v) = get("CHAINSYNC_SNAPSHOT_INTERVAL") {
            config.snapshot_interval = parse_number("CHAINSYNC_SNAPSHOT_INTERVAL", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.network_id.is_empty() {
            return Err(SyncError::Config("network_id must not be empty".into()));
        }
        if self.window_size == 0 {
            return Err(SyncError::Config("window_size must be at least 1".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(SyncError::Config("event_channel_capacity must be at least 1".into()));
        }
        if let (Some(start), Some(max)) = (self.start_height, self.max_block_height) {
            if start > max {
                return Err(SyncError::Config(format!(
                    "start height {start} is above max block height {max}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, SyncError> {
    value
        .parse::<u64>()
        .map_err(|e| SyncError::Config(format!("{key}={value:?}: {e}")))
}

/// Fluent builder for [`SyncConfig`].
#[derive(Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    /// Set the network aggregate id.
    pub fn network_id(mut self, id: impl Into<String>) -> Self {
        self.config.network_id = id.into();
        self
    }

    /// Set the first block to ingest (historical mode).
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = Some(height);
        self
    }

    /// Set the highest block to ingest.
    pub fn max_block_height(mut self, height: u64) -> Self {
        self.config.max_block_height = Some(height);
        self
    }

    /// Set the retained block window of the network aggregate.
    pub fn window_size(mut self, size: usize) -> Self {
        self.config.window_size = size;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// Snapshot every `interval` events per aggregate (`0` = never).
    pub fn snapshot_interval(mut self, interval: u64) -> Self {
        self.config.snapshot_interval = interval;
        self
    }

    /// Set the saga retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
