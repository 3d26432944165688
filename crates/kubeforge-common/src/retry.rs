//! Retry and polling primitives shared by provisioning and teardown.
//!
//! [`with_retry`] re-attempts an operation with exponential backoff, but only
//! while a caller-supplied predicate classifies the failure as transient.
//! [`poll_until`] is the fixed-interval variant used by the node wait loops:
//! it re-checks a condition until it holds, the timeout elapses, or the caller
//! cancels.
//!
//! # Example
//!
//! ```ignore
//! use kubeforge_common::retry::{with_retry, RetryConfig};
//!
//! with_retry(
//!     &RetryConfig::new(6, Duration::from_secs(5)),
//!     "delete security boundary",
//!     Error::is_dependency_violation,
//!     || backend.delete_security_boundary(&id),
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Configuration for [`with_retry`].
///
/// The delay before attempt `i` (1-indexed, `i >= 2`) is
/// `base_delay * 2^(i-2)`; there is no separate cap, the attempt count bounds it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total number of attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Create a config with explicit attempts and base delay
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Default base delay with a specific number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay to wait before the given attempt (1-indexed)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Execute an async operation, retrying failures `is_retryable` accepts.
///
/// Calls `operation` at most `config.max_attempts` times. A failure the
/// predicate rejects is returned immediately without consuming the remaining
/// attempts; once attempts are exhausted the last error is returned.
pub async fn with_retry<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = config.delay_before(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Timeout and interval of a fixed-interval poll loop
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Overall budget for the loop
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Delay between checks
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl PollConfig {
    /// Create a poll config
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Outcome of one poll check
///
/// - `Ok(Some(value))` - condition met, stop polling and return value
/// - `Ok(None)` - condition not yet met, keep polling
/// - `Err(e)` - stop with `e`, unless it is retryable in which case polling continues
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check` every `config.interval` until it yields a value.
///
/// Cancellation is observed before every check and during every sleep, so a
/// cancelled caller stops within one interval. Retryable errors from `check`
/// are logged and polled through; anything else ends the loop.
pub async fn poll_until<T, F, Fut>(
    config: &PollConfig,
    description: &str,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(description));
        }

        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_retryable() => {
                debug!(operation = %description, error = %e, "Transient error while polling");
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= config.timeout {
            return Err(Error::timeout(description, config.timeout));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(description)),
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

/// Sleep for `duration` unless cancelled first
pub async fn sleep_or_cancel(
    duration: Duration,
    description: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled(description)),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Serialize a `Duration` as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as integer seconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    /// Deserialize from integer seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
