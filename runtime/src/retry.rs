//! Bounded exponential backoff for gateway calls.
//!
//! Refunds run after the booking's unit of work has committed, so a
//! transient gateway failure is retried here a few times before the
//! failure is recorded on the ledger for an admin to retry.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff schedule.
///
/// Defaults: 3 retries, 100ms initial delay doubling up to 5 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor between retries
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `operation`, retrying while `is_transient` says the error may clear.
///
/// A permanent error is returned immediately; a transient one is returned
/// after `policy.max_retries` retries.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn retry_transient<F, Fut, T, E, P>(policy: RetryPolicy, mut operation: F, is_transient: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "gateway call succeeded after retry");
                }
                return Ok(value);
            },
            Err(error) if !is_transient(&error) || attempt >= policy.max_retries => {
                tracing::warn!(attempt, %error, "gateway call failed");
                return Err(error);
            },
            Err(error) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis(), %error, "retrying gateway call");
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
