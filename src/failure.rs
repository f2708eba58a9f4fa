//! Hop failure classification and the retry/backoff policy.

use std::io;
use std::time::Duration;

use rand::Rng;
use serde_json::{Value, json};

use crate::config::Config;

/// Failure raised by a label handler.
///
/// Modeled failures are not errors: handlers return `Directive::Fail` for
/// those. Anything raised here is either retried or paged.
#[derive(Debug, thiserror::Error)]
pub enum HopError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{message}")]
    Fatal { message: String, details: Value },
}

impl HopError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal {
            message: err.to_string(),
            details: Value::Null,
        }
    }

    pub fn fatal_with(err: impl std::fmt::Display, details: Value) -> Self {
        Self::Fatal {
            message: err.to_string(),
            details,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

fn classify_io(err: &io::Error) -> FailureClass {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// Classify an unstructured error by walking its cause chain.
///
/// Remote-call timeouts and dropped connections are retryable; anything
/// unrecognised is fatal.
pub fn classify(err: &anyhow::Error) -> FailureClass {
    for cause in err.chain() {
        if let Some(hop) = cause.downcast_ref::<HopError>() {
            return if hop.is_transient() {
                FailureClass::Transient
            } else {
                FailureClass::Fatal
            };
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && classify_io(io_err) == FailureClass::Transient
        {
            return FailureClass::Transient;
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return FailureClass::Transient;
        }
    }
    FailureClass::Fatal
}

impl From<anyhow::Error> for HopError {
    fn from(err: anyhow::Error) -> Self {
        match classify(&err) {
            FailureClass::Transient => Self::Transient(format!("{err:#}")),
            FailureClass::Fatal => Self::Fatal {
                message: format!("{err:#}"),
                details: json!({
                    "chain": err.chain().map(ToString::to_string).collect::<Vec<_>>(),
                }),
            },
        }
    }
}

impl From<io::Error> for HopError {
    fn from(err: io::Error) -> Self {
        match classify_io(&err) {
            FailureClass::Transient => Self::Transient(err.to_string()),
            FailureClass::Fatal => {
                Self::fatal_with(&err, json!({"io_kind": err.kind().to_string()}))
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for HopError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Exponential backoff with a cap and downward jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Transient failures tolerated before the strand is paged.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
            jitter: config.retry_jitter,
        }
    }

    /// Policy that retries immediately, for tests and local runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Whether the `retry_count`-th consecutive failure exceeds the budget.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }

    /// Un-jittered delay before retry number `retry_count` (1-based).
    pub fn base_backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_with(retry_count, &mut rand::thread_rng())
    }

    pub fn backoff_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let delay = self.base_backoff(retry_count);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let shave = rng.gen_range(0.0..=jitter);
        delay.mul_f64(1.0 - shave)
    }
}
