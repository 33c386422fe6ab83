//! Service configuration loaded from `DOCFLOW_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DOCFLOW_BIND_ADDR` | `0.0.0.0:8080` |
//! | `DOCFLOW_WORKER_URL` | `http://127.0.0.1:9000` |
//! | `DOCFLOW_WORKER_TIMEOUT_SECS` | unset (no timeout) |
//! | `DOCFLOW_DATABASE_URL` | unset (in-memory stores) |
//! | `DOCFLOW_POLL_INTERVAL_SECS` | `15` |
//! | `DOCFLOW_POLL_BATCH_SIZE` | `50` |
//! | `DOCFLOW_STALL_AFTER_SECS` | `60` |
//! | `DOCFLOW_STEP_RETENTION_SECS` | `604800` (7 days) |
//! | `DOCFLOW_DISPATCH_LEASE_SECS` | `900` |
//! | `DOCFLOW_TENANT_LIMIT` | `5` |
//! | `DOCFLOW_GLOBAL_LIMIT` | `20` |
//! | `DOCFLOW_MAX_ATTEMPTS` | `3` |
//! | `DOCFLOW_INITIAL_INTERVAL_SECS` | `300` |
//! | `DOCFLOW_BACKOFF_MULTIPLIER` | `2` |
//!
//! The log format (`DOCFLOW_LOG_FORMAT`) is read by the tracing setup, which
//! runs before this configuration is loaded.

use std::str::FromStr;
use std::time::Duration;

use docflow_documents::ProcessingPolicy;

use crate::poller::RetryPollerConfig;
use crate::processor::DEFAULT_DISPATCH_LEASE_SECS;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub worker_url: String,
    pub worker_timeout: Option<Duration>,
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub poll_batch_size: usize,
    /// Idle time after which the poller resumes an unfinished run.
    pub stall_after: Duration,
    /// How long step records of finished runs are kept.
    pub step_retention: Duration,
    pub dispatch_lease: Duration,
    pub policy: ProcessingPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_url: "http://127.0.0.1:9000".to_string(),
            worker_timeout: None,
            database_url: None,
            poll_interval: Duration::from_secs(15),
            poll_batch_size: 50,
            stall_after: Duration::from_secs(60),
            step_retention: Duration::from_secs(7 * 24 * 60 * 60),
            dispatch_lease: Duration::from_secs(DEFAULT_DISPATCH_LEASE_SECS as u64),
            policy: ProcessingPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("invalid processing policy: {0}")]
    Policy(String),
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, test map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut policy = defaults.policy;

        policy.limits.tenant_limit = parse_or(&lookup, "DOCFLOW_TENANT_LIMIT", policy.limits.tenant_limit)?;
        policy.limits.global_limit = parse_or(&lookup, "DOCFLOW_GLOBAL_LIMIT", policy.limits.global_limit)?;
        policy.retry.max_attempts = parse_or(&lookup, "DOCFLOW_MAX_ATTEMPTS", policy.retry.max_attempts)?;
        policy.retry.initial_interval_secs = parse_or(
            &lookup,
            "DOCFLOW_INITIAL_INTERVAL_SECS",
            policy.retry.initial_interval_secs,
        )?;
        policy.retry.backoff_multiplier = parse_or(
            &lookup,
            "DOCFLOW_BACKOFF_MULTIPLIER",
            policy.retry.backoff_multiplier,
        )?;
        policy
            .validate()
            .map_err(|e| ConfigError::Policy(e.to_string()))?;

        let poll_secs = positive(&lookup, "DOCFLOW_POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?;
        let poll_batch_size = positive(&lookup, "DOCFLOW_POLL_BATCH_SIZE", defaults.poll_batch_size)?;
        let stall_secs: u64 = parse_or(&lookup, "DOCFLOW_STALL_AFTER_SECS", defaults.stall_after.as_secs())?;
        let retention_secs: u64 = parse_or(
            &lookup,
            "DOCFLOW_STEP_RETENTION_SECS",
            defaults.step_retention.as_secs(),
        )?;
        let lease_secs = positive(&lookup, "DOCFLOW_DISPATCH_LEASE_SECS", defaults.dispatch_lease.as_secs())?;

        let worker_timeout = match non_empty(&lookup, "DOCFLOW_WORKER_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse(&raw, "DOCFLOW_WORKER_TIMEOUT_SECS")?)),
            None => None,
        };

        Ok(Self {
            bind_addr: non_empty(&lookup, "DOCFLOW_BIND_ADDR").unwrap_or(defaults.bind_addr),
            worker_url: non_empty(&lookup, "DOCFLOW_WORKER_URL").unwrap_or(defaults.worker_url),
            worker_timeout,
            database_url: non_empty(&lookup, "DOCFLOW_DATABASE_URL"),
            poll_interval: Duration::from_secs(poll_secs),
            poll_batch_size,
            stall_after: Duration::from_secs(stall_secs),
            step_retention: Duration::from_secs(retention_secs),
            dispatch_lease: Duration::from_secs(lease_secs),
            policy,
        })
    }

    pub fn retry_poller_config(&self) -> RetryPollerConfig {
        RetryPollerConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.poll_batch_size)
            .with_stall_after(self.stall_after)
            .with_retention(self.step_retention)
    }

    pub fn dispatch_lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.dispatch_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_DISPATCH_LEASE_SECS))
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T: FromStr>(raw: &str, key: &'static str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + ToString,
{
    let value = parse_or(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, key) {
        Some(raw) => parse(&raw, key),
        None => Ok(default),
    }
}
