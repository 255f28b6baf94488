//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::DEFAULT_MAX_ATTEMPTS;

/// Environment variable naming the shared storage root.
pub const STORAGE_ROOT_ENV: &str = "OFFLOAD_STORAGE_ROOT";

/// Where conversations, job statuses and job descriptors live, plus the
/// defaults applied when work is submitted.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Retry budget for jobs submitted without an explicit one.
    pub default_max_attempts: u32,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let root = lookup(STORAGE_ROOT_ENV)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: STORAGE_ROOT_ENV.to_string(),
                hint: "Point it at a directory shared by every worker process".to_string(),
            })?;
        Ok(Self {
            default_max_attempts: parse_var(&lookup, "OFFLOAD_MAX_ATTEMPTS")?
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            ..Self::new(root)
        })
    }
}

/// Worker scheduler configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between queue scans.
    pub poll_interval: Duration,
    /// Maximum number of jobs executing at once in this process.
    pub max_concurrent_jobs: usize,
    /// In-progress jobs not updated within this window are presumed abandoned.
    pub stall_threshold: Duration,
    /// First retry delay; doubles per attempt. Zero disables backoff.
    pub retry_backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_concurrent_jobs: 3,
            stall_threshold: Duration::from_secs(300), // 5 minutes
            retry_backoff_base: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key/value source, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |key: &str| -> Result<Option<Duration>, ConfigError> {
            Ok(parse_var::<u64>(&lookup, key)?.map(Duration::from_millis))
        };
        Ok(Self {
            poll_interval: millis("OFFLOAD_POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            max_concurrent_jobs: parse_var(&lookup, "OFFLOAD_MAX_CONCURRENT_JOBS")?
                .unwrap_or(defaults.max_concurrent_jobs),
            stall_threshold: parse_var::<u64>(&lookup, "OFFLOAD_STALL_THRESHOLD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_threshold),
            retry_backoff_base: millis("OFFLOAD_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.retry_backoff_base),
            retry_backoff_max: millis("OFFLOAD_RETRY_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.retry_backoff_max),
        })
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.retry_backoff_base.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.retry_backoff_max)
            .min(self.retry_backoff_max)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}
