//! Configuration management for the sync coordinator.

use canopy_engine::{FlushPolicy, RetryPolicy, DEFAULT_BATCH_SIZE, DEFAULT_SYNC_INTERVAL};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default time budget of a single flush.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Sync configuration, loaded from environment variables or built in code.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Queue length that triggers a flush, and the largest batch sent at once
    pub batch_size: usize,
    /// Periodic flush interval
    pub sync_interval: Duration,
    /// A flush taking longer than this counts as failed
    pub flush_timeout: Duration,
    /// Backoff for failed flushes
    pub retry: RetryPolicy,
    /// Directory for on-disk queue persistence (in-memory when unset)
    pub data_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            retry: RetryPolicy::default(),
            data_dir: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let batch_size = parse_var("CANOPY_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "CANOPY_BATCH_SIZE",
            });
        }

        let sync_interval = Duration::from_secs(parse_var(
            "CANOPY_SYNC_INTERVAL_SECS",
            defaults.sync_interval.as_secs(),
        )?);
        if sync_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CANOPY_SYNC_INTERVAL_SECS",
            });
        }
        let flush_timeout = Duration::from_secs(parse_var(
            "CANOPY_FLUSH_TIMEOUT_SECS",
            defaults.flush_timeout.as_secs(),
        )?);
        if flush_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CANOPY_FLUSH_TIMEOUT_SECS",
            });
        }

        let retry = RetryPolicy {
            initial_delay: Duration::from_millis(parse_var(
                "CANOPY_RETRY_INITIAL_MS",
                defaults.retry.initial_delay.as_millis() as u64,
            )?),
            multiplier: parse_var("CANOPY_RETRY_MULTIPLIER", defaults.retry.multiplier)?,
            max_delay: Duration::from_millis(parse_var(
                "CANOPY_RETRY_MAX_DELAY_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
            max_attempts: parse_var("CANOPY_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
        };

        let data_dir = env::var("CANOPY_DATA_DIR").ok().map(PathBuf::from);

        Ok(Self {
            batch_size,
            sync_interval,
            flush_timeout,
            retry,
            data_dir,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Trigger policy derived from this configuration.
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.batch_size, self.sync_interval)
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}")]
    Invalid { key: &'static str },
}
