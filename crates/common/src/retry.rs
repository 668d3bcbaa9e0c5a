//! Bounded retry with exponential backoff.
//!
//! Only errors classified as [`ErrorClass::TransientNetwork`] are retried.
//! Everything else is returned to the caller on the first occurrence.
//!
//! [`ErrorClass::TransientNetwork`]: crate::errors::ErrorClass::TransientNetwork

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::Classify;

/// Default number of attempts (first try included)
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling for a single backoff delay
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with fixed bounds and no jitter, handy in tests
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: backoff,
            max_backoff: backoff,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64).min(self.max_backoff)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff_for(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as u64 / 10;
        let extra = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(extra)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retrying after `error` ended attempt number `attempt`
    /// (1-based), or `None` when the error is final or attempts are spent.
    ///
    /// For call sites that cannot hand [`retry`] a re-callable closure,
    /// such as calls that borrow protocol state mutably.
    pub fn retry_delay<E: Classify>(&self, attempt: u32, error: &E) -> Option<Duration> {
        if error.class().is_retryable() && attempt < self.attempts() {
            Some(self.delay_for(attempt))
        } else {
            None
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                let Some(delay) = policy.retry_delay(attempt, &e) else {
                    return Err(e);
                };
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
