//! Configuration types for msg-relay

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::types::FailureKind;

/// Batch and worker pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of references in one batch (default: 300)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Concurrent transfer jobs per batch session (default: 3)
    ///
    /// Also the size of the look-ahead window used to report completions
    /// in sequence order.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Concurrent transfer jobs across all users (default: 9)
    #[serde(default = "default_max_global_transfers")]
    pub max_global_transfers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            concurrency: default_concurrency(),
            max_global_transfers: default_max_global_transfers(),
        }
    }
}

/// Retry configuration for failed transfer attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per job, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Upper bound for a single backoff delay (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random jitter as a fraction of the delay, applied in both directions (default: 0.2)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Upper bound for a wait requested by a rate-limit response (default: 60 seconds)
    #[serde(default = "default_max_rate_limit_wait", with = "duration_serde")]
    pub max_rate_limit_wait: Duration,

    /// Overrides for the transport error classification table
    ///
    /// Keys are transport error codes (e.g. `"timeout"`, `"connection_lost"`),
    /// values are `transient`, `fatal` or `crash_class`.
    #[serde(default)]
    pub classification: HashMap<String, FailureKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            max_rate_limit_wait: default_max_rate_limit_wait(),
            classification: HashMap::new(),
        }
    }
}

/// Progress throttling settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Samples kept per job for speed smoothing (default: 8)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Percentage bucket size; crossing a bucket boundary emits a snapshot (default: 5)
    #[serde(default = "default_percent_bucket")]
    pub percent_bucket: u8,

    /// Minimum interval between snapshots within one bucket (default: 2 seconds)
    #[serde(default = "default_min_interval", with = "duration_serde")]
    pub min_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            percent_bucket: default_percent_bucket(),
            min_interval: default_min_interval(),
        }
    }
}

/// Local staging storage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory for staged files (default: "./downloads")
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Largest content accepted for staging, in bytes (default: 2 GiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Age after which leftover staged files are swept (default: 24 hours)
    #[serde(default = "default_stale_after", with = "duration_serde")]
    pub stale_after: Duration,

    /// Sweep stale staged files when the orchestrator starts (default: true)
    #[serde(default = "default_true")]
    pub sweep_on_start: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            max_file_size: default_max_file_size(),
            stale_after: default_stale_after(),
            sweep_on_start: true,
        }
    }
}

/// Main configuration for BatchOrchestrator
///
/// Every field has a default, so `{}` is a valid JSON configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Batch size and concurrency
    #[serde(default)]
    pub batch: BatchConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Progress throttling
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Local staging storage
    #[serde(default)]
    pub staging: StagingConfig,
}

impl Config {
    /// Load a JSON configuration file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size == 0 {
            return Err(Error::config(
                "batch.max_batch_size",
                "max_batch_size must be at least 1",
            ));
        }
        if self.batch.concurrency == 0 {
            return Err(Error::config(
                "batch.concurrency",
                "concurrency must be at least 1",
            ));
        }
        if self.batch.max_global_transfers == 0 {
            return Err(Error::config(
                "batch.max_global_transfers",
                "max_global_transfers must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "retry.max_attempts",
                "max_attempts counts the first attempt and must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return Err(Error::config(
                "retry.jitter_ratio",
                format!(
                    "jitter_ratio must be in [0.0, 1.0), got {}",
                    self.retry.jitter_ratio
                ),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff_multiplier must be at least 1.0",
            ));
        }
        if self.retry.classification.values().any(|k| *k == FailureKind::Cancelled) {
            return Err(Error::config(
                "retry.classification",
                "cancelled is reserved for user aborts and cannot be assigned",
            ));
        }
        if self.progress.window_size < 2 {
            return Err(Error::config(
                "progress.window_size",
                "window_size needs at least two samples to measure speed",
            ));
        }
        if !(1..=100).contains(&self.progress.percent_bucket) {
            return Err(Error::config(
                "progress.percent_bucket",
                "percent_bucket must be between 1 and 100",
            ));
        }
        Ok(())
    }
}

// Durations are written as (fractional) seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

fn default_max_batch_size() -> usize {
    300
}

fn default_concurrency() -> usize {
    3
}

fn default_max_global_transfers() -> usize {
    9
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_max_rate_limit_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_window_size() -> usize {
    8
}

fn default_percent_bucket() -> u8 {
    5
}

fn default_min_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_stale_after() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_true() -> bool {
    true
}
