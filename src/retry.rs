//! Retry-with-backoff wrapper for remote operations.
//!
//! Every call to the queue, blob store and key-value store goes through
//! [`with_retry`]: errors classified as transient by the caller are
//! retried with exponential backoff, anything else is returned
//! unmodified on the first attempt. Attempts are bounded so a dependency
//! outage surfaces as a terminal [`RetryError::Exhausted`] instead of
//! occupying a worker loop forever.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Exponential backoff parameters for retried operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep before the second attempt.
    pub initial_interval: Duration,
    /// Upper bound for the backoff interval.
    pub max_interval: Duration,
    /// Interval growth factor between attempts.
    pub multiplier: f64,
    /// Total attempts (including the first) before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error> {
    /// The operation failed with a non-transient error; returned as-is.
    #[error(transparent)]
    Permanent(E),
    /// Every allowed attempt failed with a transient error.
    #[error("operation still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Runs `op`, retrying with backoff while it fails with an error for
/// which `is_transient` returns true.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut interval = policy.initial_interval;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempts >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: err,
                    });
                }
                debug!(
                    attempt = attempts,
                    backoff_ms = interval.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(interval).await;
                interval = interval.mul_f64(policy.multiplier).min(policy.max_interval);
            }
            Err(err) => return Err(RetryError::Permanent(err)),
        }
    }
}
