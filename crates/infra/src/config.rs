//! Scheduler configuration.
//!
//! Defaults suit production; every field can be overridden from the
//! environment with [`SchedulerConfig::from_env`].

use std::time::Duration;

use thiserror::Error;

use crate::jobs::RetryPolicy;

pub const ENV_SCHEDULER_NAME: &str = "SAGAFLOW_SCHEDULER_NAME";
pub const ENV_POLL_INTERVAL_SECS: &str = "SAGAFLOW_POLL_INTERVAL_SECS";
pub const ENV_WORKERS: &str = "SAGAFLOW_WORKERS";
pub const ENV_EXECUTION_TIMEOUT_SECS: &str = "SAGAFLOW_EXECUTION_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "SAGAFLOW_MAX_RETRIES";
pub const ENV_RETRY_BASE_SECS: &str = "SAGAFLOW_RETRY_BASE_SECS";
pub const ENV_RETRY_MAX_SECS: &str = "SAGAFLOW_RETRY_MAX_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Name for logging and thread names.
    pub name: String,
    /// How often the poll loop looks for due jobs.
    pub poll_interval: Duration,
    /// Size of the execution worker pool.
    pub workers: usize,
    /// Upper bound for one handler invocation; expiry counts as a failure.
    pub execution_timeout: Duration,
    /// Retry budget for jobs scheduled without an explicit one.
    pub default_max_retries: u32,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "job-scheduler".to_string(),
            poll_interval: Duration::from_secs(10),
            workers: 4,
            execution_timeout: Duration::from_secs(5 * 60),
            default_max_retries: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Defaults overridden by `SAGAFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SAGAFLOW_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_SCHEDULER_NAME) {
            config.name = name;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_POLL_INTERVAL_SECS)? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(workers) = parse::<usize>(&lookup, ENV_WORKERS)? {
            config.workers = workers;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_EXECUTION_TIMEOUT_SECS)? {
            config.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<u32>(&lookup, ENV_MAX_RETRIES)? {
            config.default_max_retries = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_RETRY_BASE_SECS)? {
            config.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_RETRY_MAX_SECS)? {
            config.retry.max_delay = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid(ENV_WORKERS, "0", "at least one worker is required"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid(ENV_POLL_INTERVAL_SECS, "0", "must be positive"));
        }
        if self.execution_timeout.is_zero() {
            return Err(invalid(ENV_EXECUTION_TIMEOUT_SECS, "0", "must be positive"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid(
                ENV_RETRY_MAX_SECS,
                &self.retry.max_delay.as_secs().to_string(),
                "must not be below the base delay",
            ));
        }
        Ok(())
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
