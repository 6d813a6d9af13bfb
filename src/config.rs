//! MapWAL Configuration
//!
//! This module provides configuration structures for the map write-ahead
//! log: which backend to use and where, how writes become durable, and how
//! the background worker pool is sized.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::{RejectionPolicy, ShutdownPolicy};
use crate::tuning::{self, PoolSizing};
use crate::wal::writer::Durability;

/// Main MapWAL configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapWalConfig {
    /// Backend and storage location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Durability mode and worker pool
    #[serde(default)]
    pub wal: WalConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend and storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registered backend name
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Bytes of serialized records per segment before rotating
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Filesystem root all WAL paths are relative to
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Record serializer (bincode, json)
    #[serde(default = "default_serializer")]
    pub serializer: String,

    /// Enable LZ4 compression of records
    #[serde(default)]
    pub compression: bool,

    /// Sync segment files after every append (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Durability mode and worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// sync or async
    #[serde(default)]
    pub mode: Durability,

    /// Longest time close() waits for running background writes
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Background worker pool (async mode only)
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Core threads (default: 2 x cores + 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_threads: Option<usize>,

    /// Thread ceiling when the queue is full (default: 4 x cores + 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<usize>,

    /// Pending tasks the queue holds before overflow handling kicks in
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long an overflow thread waits for more work before exiting
    #[serde(default)]
    pub keep_alive_ms: u64,

    /// What to do when queue and threads are saturated
    #[serde(default)]
    pub rejection: RejectionPolicy,

    /// What happens to queued tasks on close
    #[serde(default)]
    pub shutdown: ShutdownPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_backend() -> String {
    "segment".to_string()
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/mapwal")
}

fn default_serializer() -> String {
    "bincode".to_string()
}

fn default_true() -> bool {
    true
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            block_size: default_block_size(),
            root: default_root(),
            serializer: default_serializer(),
            compression: false,
            fsync: true,
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            mode: Durability::default(),
            close_timeout_ms: default_close_timeout_ms(),
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: None,
            max_threads: None,
            queue_capacity: default_queue_capacity(),
            keep_alive_ms: 0,
            rejection: RejectionPolicy::default(),
            shutdown: ShutdownPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl StorageConfig {
    /// Validate the storage section
    pub fn validate(&self) -> crate::Result<()> {
        if self.backend.is_empty() {
            return Err(crate::Error::Config("storage.backend cannot be empty".into()));
        }

        if self.block_size == 0 {
            return Err(crate::Error::Config(
                "storage.block_size must be greater than 0".into(),
            ));
        }

        crate::serializer::by_name(&self.serializer)?;
        Ok(())
    }
}

impl WalConfig {
    /// Get close timeout as Duration
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl PoolConfig {
    /// Resolve thread counts, filling unset values from the CPU count
    pub fn sizing(&self) -> PoolSizing {
        let detected = tuning::pool_sizing();
        let min_threads = self.min_threads.unwrap_or(detected.min_threads);
        let max_threads = self
            .max_threads
            .unwrap_or(detected.max_threads)
            .max(min_threads);

        PoolSizing {
            min_threads,
            max_threads,
            queue_capacity: self.queue_capacity,
            detected_cores: detected.detected_cores,
        }
    }

    /// Get keep-alive as Duration
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Validate the pool section
    pub fn validate(&self) -> crate::Result<()> {
        if self.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "wal.pool.queue_capacity must be greater than 0".into(),
            ));
        }

        if self.min_threads == Some(0) || self.max_threads == Some(0) {
            return Err(crate::Error::Config(
                "wal.pool thread counts must be greater than 0".into(),
            ));
        }

        if let (Some(min), Some(max)) = (self.min_threads, self.max_threads) {
            if min > max {
                return Err(crate::Error::Config(format!(
                    "wal.pool.min_threads ({}) exceeds max_threads ({})",
                    min, max
                )));
            }
        }

        Ok(())
    }
}

impl MapWalConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MapWalConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (used by `mapwal init`)
    pub fn to_toml_string(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate()?;
        self.wal.pool.validate()?;

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Parent path of one map's log, relative to the storage root
    pub fn map_path(&self, map_name: &str) -> PathBuf {
        PathBuf::from("maps").join(map_name)
    }
}
