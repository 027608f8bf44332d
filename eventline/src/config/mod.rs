//! Pipeline configuration.
//!
//! [`PipelineConfig`] is the runtime configuration passed to
//! [`crate::pipeline::Pipeline::start`]. [`ConfigFile`] is its on-disk INI
//! form, used by the CLI and by hosts that prefer a config file.

mod file;

pub use file::{default_config_path, parse_size, ConfigFile, ConfigFileError, TransportSettings};

use std::path::PathBuf;
use std::time::Duration;

use crate::compression::Compression;
use crate::connectivity::MeteredPolicy;
use crate::error::{PipelineError, PipelineResult};
use crate::scheduler::SchedulerConfig;
use crate::transport::{BackoffPolicy, EngineConfig};

/// Default number of pending records that triggers a drain.
pub const DEFAULT_MAX_BATCH_COUNT: usize = 100;

/// Default cap on the summed payload size of one batch (512 KiB).
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 512 * 1024;

/// Default age of the oldest pending record that triggers a drain.
pub const DEFAULT_MAX_LATENCY_MS: u64 = 2_000;

/// Default attempts before a record is dropped.
pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Default age after which an in-flight record is presumed lost.
pub const DEFAULT_STALE_IN_FLIGHT_SECS: u64 = 60;

/// Default storage quota (16 MiB).
pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 16 * 1024 * 1024;

/// Default worker evaluation interval.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

/// Default timeout for a single send.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;

/// Configuration for one pipeline instance.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Pending count that triggers a drain; also the batch size limit.
    pub max_batch_count: usize,
    /// Summed encoded record size per batch (payload plus fixed per-record
    /// overhead). A single larger record is still sent alone.
    pub max_batch_bytes: u64,
    /// Age of the oldest pending record that triggers a drain.
    pub max_latency: Duration,
    /// Attempts before a record is dropped.
    pub retry_ceiling: u32,
    pub backoff: BackoffPolicy,
    /// Which priorities may go out over metered connections.
    pub allow_metered_transmission: MeteredPolicy,
    /// In-flight records older than this return to pending.
    pub stale_in_flight_timeout: Duration,
    /// Oldest pending records are evicted above this size.
    pub storage_quota_bytes: u64,
    /// SQLite file. `None` keeps the queue in memory.
    pub storage_path: Option<PathBuf>,
    /// Fall back to an in-memory store if the file cannot be opened.
    pub memory_fallback: bool,
    pub compression: Compression,
    /// How often the worker re-evaluates triggers.
    pub tick_interval: Duration,
    pub send_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_latency: Duration::from_millis(DEFAULT_MAX_LATENCY_MS),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            backoff: BackoffPolicy::default(),
            allow_metered_transmission: MeteredPolicy::default(),
            stale_in_flight_timeout: Duration::from_secs(DEFAULT_STALE_IN_FLIGHT_SECS),
            storage_quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            storage_path: None,
            memory_fallback: true,
            compression: Compression::default(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
        }
    }
}

impl PipelineConfig {
    /// Defaults with a persistent store at `path`.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: Some(storage_path.into()),
            ..Self::default()
        }
    }

    pub fn with_max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = count;
        self
    }

    pub fn with_max_batch_bytes(mut self, bytes: u64) -> Self {
        self.max_batch_bytes = bytes;
        self
    }

    pub fn with_max_latency(mut self, latency: Duration) -> Self {
        self.max_latency = latency;
        self
    }

    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_metered_policy(mut self, policy: MeteredPolicy) -> Self {
        self.allow_metered_transmission = policy;
        self
    }

    pub fn with_stale_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.stale_in_flight_timeout = timeout;
        self
    }

    pub fn with_storage_quota_bytes(mut self, bytes: u64) -> Self {
        self.storage_quota_bytes = bytes;
        self
    }

    pub fn with_storage_path(mut self, path: Option<PathBuf>) -> Self {
        self.storage_path = path;
        self
    }

    pub fn with_memory_fallback(mut self, enabled: bool) -> Self {
        self.memory_fallback = enabled;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_batch_count == 0 {
            return Err(PipelineError::Config(
                "max_batch_count must be at least 1".to_string(),
            ));
        }
        if self.max_batch_bytes == 0 {
            return Err(PipelineError::Config(
                "max_batch_bytes must be at least 1".to_string(),
            ));
        }
        if self.retry_ceiling == 0 {
            return Err(PipelineError::Config(
                "retry_ceiling must be at least 1".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(PipelineError::Config(
                "tick_interval must be non-zero".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(PipelineError::Config(
                "send_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_batch_count: self.max_batch_count,
            max_latency: self.max_latency,
        }
    }

    pub(crate) fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            compression: self.compression,
            backoff: self.backoff.clone(),
            retry_ceiling: self.retry_ceiling,
            send_timeout: self.send_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_batch_count, 100);
        assert_eq!(config.max_batch_bytes, 512 * 1024);
        assert_eq!(config.max_latency, Duration::from_secs(2));
        assert_eq!(config.retry_ceiling, 5);
        assert_eq!(config.stale_in_flight_timeout, Duration::from_secs(60));
        assert_eq!(config.storage_quota_bytes, 16 * 1024 * 1024);
        assert!(config.memory_fallback);
        assert!(config.storage_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::new("/tmp/events.db")
            .with_max_batch_count(5)
            .with_max_latency(Duration::from_millis(100))
            .with_retry_ceiling(3)
            .with_compression(Compression::None)
            .with_memory_fallback(false);
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/events.db")));
        assert_eq!(config.max_batch_count, 5);
        assert_eq!(config.scheduler_config().max_latency, Duration::from_millis(100));
        assert_eq!(config.engine_config().retry_ceiling, 3);
        assert_eq!(config.engine_config().compression, Compression::None);
        assert!(!config.memory_fallback);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PipelineConfig::default().with_max_batch_count(0).validate().is_err());
        assert!(PipelineConfig::default().with_max_batch_bytes(0).validate().is_err());
        assert!(PipelineConfig::default().with_retry_ceiling(0).validate().is_err());
        assert!(PipelineConfig::default()
            .with_tick_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
