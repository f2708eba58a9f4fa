//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `STRAND_DATABASE_URL`: PostgreSQL connection string (required)
//! - `STRAND_WORKER_CONCURRENCY`: Hops executed in parallel per worker (default: num_cpus)
//! - `STRAND_CLAIM_BATCH_SIZE`: Strands claimed per poll (default: worker concurrency)
//! - `STRAND_POLL_INTERVAL_MS`: Idle poll interval (default: 500)
//! - `STRAND_LEASE_SECS`: Lease duration on claimed strands (default: 120)
//! - `STRAND_HEARTBEAT_MS`: Lease extension interval (default: 20000)
//! - `STRAND_MAX_RETRIES`: Transient failures tolerated per label (default: 10)
//! - `STRAND_RETRY_BASE_MS`: First retry delay (default: 1000)
//! - `STRAND_RETRY_MAX_MS`: Retry delay cap (default: 300000)
//! - `STRAND_RETRY_JITTER`: Fraction of the delay randomised away (default: 0.5)
//! - `STRAND_GC_INTERVAL_SECS`: Garbage collection sweep interval (default: 300)
//! - `STRAND_GC_RETENTION_SECS`: How long terminal strands are kept (default: 86400)
//! - `STRAND_GC_BATCH_SIZE`: Strands deleted per sweep batch (default: 100)
//! - `STRAND_LOG_JSON`: Emit JSON log lines (default: false)

use std::{
    env,
    str::FromStr,
    sync::{OnceLock, RwLock},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::garbage_collector::GarbageCollectorConfig;
use crate::runtime::DispatcherConfig;

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_concurrency: usize,
    pub claim_batch_size: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub heartbeat_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
    pub gc_interval_secs: u64,
    pub gc_retention_secs: u64,
    pub gc_batch_size: usize,
    pub log_json: bool,
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("invalid {name} value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("STRAND_DATABASE_URL")
            .context("STRAND_DATABASE_URL environment variable is required")?;

        let worker_concurrency = env_or("STRAND_WORKER_CONCURRENCY", num_cpus::get())?;
        if worker_concurrency == 0 {
            bail!("STRAND_WORKER_CONCURRENCY must be at least 1");
        }
        let claim_batch_size = env_or("STRAND_CLAIM_BATCH_SIZE", worker_concurrency)?;

        let retry_jitter: f64 = env_or("STRAND_RETRY_JITTER", 0.5)?;
        if !(0.0..=1.0).contains(&retry_jitter) {
            bail!("STRAND_RETRY_JITTER must be between 0 and 1, got {retry_jitter}");
        }

        let config = Self {
            database_url,
            worker_concurrency,
            claim_batch_size,
            poll_interval_ms: env_or("STRAND_POLL_INTERVAL_MS", 500)?,
            lease_secs: env_or("STRAND_LEASE_SECS", 120)?,
            heartbeat_ms: env_or("STRAND_HEARTBEAT_MS", 20_000)?,
            max_retries: env_or("STRAND_MAX_RETRIES", 10)?,
            retry_base_ms: env_or("STRAND_RETRY_BASE_MS", 1_000)?,
            retry_max_ms: env_or("STRAND_RETRY_MAX_MS", 300_000)?,
            retry_jitter,
            gc_interval_secs: env_or("STRAND_GC_INTERVAL_SECS", 300)?,
            gc_retention_secs: env_or("STRAND_GC_RETENTION_SECS", 86_400)?,
            gc_batch_size: env_or("STRAND_GC_BATCH_SIZE", 100)?,
            log_json: env_flag("STRAND_LOG_JSON"),
        };

        if config.heartbeat_ms >= config.lease_secs * 1000 {
            bail!(
                "STRAND_HEARTBEAT_MS ({}) must be shorter than the lease ({}s)",
                config.heartbeat_ms,
                config.lease_secs
            );
        }

        Ok(config)
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            worker_concurrency: 4,
            claim_batch_size: 4,
            poll_interval_ms: 50,
            lease_secs: 30,
            heartbeat_ms: 5_000,
            max_retries: 3,
            retry_base_ms: 10,
            retry_max_ms: 100,
            retry_jitter: 0.0,
            gc_interval_secs: 60,
            gc_retention_secs: 3600,
            gc_batch_size: 10,
            log_json: false,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_id: Uuid::new_v4(),
            concurrency: self.worker_concurrency,
            claim_batch_size: self.claim_batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_duration: Duration::from_secs(self.lease_secs),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
        }
    }

    pub fn gc_config(&self) -> GarbageCollectorConfig {
        GarbageCollectorConfig {
            interval: Duration::from_secs(self.gc_interval_secs),
            batch_size: self.gc_batch_size,
            retention: Duration::from_secs(self.gc_retention_secs),
        }
    }
}

/// Get the global configuration, loading from environment if not yet initialized.
///
/// # Panics
///
/// Panics if configuration loading fails (e.g., missing required STRAND_DATABASE_URL).
pub fn get_config() -> Config {
    CONFIG
        .get_or_init(|| {
            let config = Config::from_env().expect("failed to load configuration from environment");
            RwLock::new(config)
        })
        .read()
        .expect("config lock poisoned")
        .clone()
}

/// Like `get_config()` but returns a Result instead of panicking.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().expect("config lock poisoned").clone()),
        None => {
            let config = Config::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
            Ok(lock.read().expect("config lock poisoned").clone())
        }
    }
}

/// Get the database URL from environment
pub fn database_url() -> Result<String> {
    dotenvy::dotenv().ok();
    env::var("STRAND_DATABASE_URL").context("STRAND_DATABASE_URL environment variable is required")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::RetryPolicy;

    #[test]
    fn test_config_derives_dispatcher_settings() {
        let config = Config::test_config("postgres://test");
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.concurrency, 4);
        assert_eq!(dispatcher.lease_duration, Duration::from_secs(30));
        assert!(dispatcher.heartbeat_interval < dispatcher.lease_duration);
    }

    #[test]
    fn test_config_derives_retry_policy() {
        let config = Config::test_config("postgres://test");
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_config_derives_gc_settings() {
        let gc = Config::test_config("postgres://test").gc_config();
        assert_eq!(gc.retention, Duration::from_secs(3600));
        assert_eq!(gc.batch_size, 10);
    }
}
