//! Retry with exponential backoff.
//!
//! One policy type drives both the stream connector's reconnect loop
//! (unbounded attempts, capped delay) and the bounded retries around origin
//! fetches during backfill.
//!
//! # Usage
//!
//! ```rust,ignore
//! use brewline_core::retry::{RetryPolicy, with_smart_retry};
//!
//! let policy = RetryPolicy::origin_fetch();
//!
//! let page = with_smart_retry(&policy, || async {
//!     fetch_page(&client, &url).await
//! }).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{BackfillError, Error, Result};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Jitter as a fraction of the computed delay (0.1 = ±10%).
    pub jitter_percent: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for the firehose reconnect loop: never gives up.
    #[must_use]
    pub fn stream_reconnect(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new(initial_delay, max_delay, 2.0, 0.1, None)
    }

    /// Policy for origin page fetches during backfill: 3 attempts, 500ms initial.
    #[must_use]
    pub fn origin_fetch() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // 31 doublings already exceed any practical cap
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Run `operation`, retrying only failures that [`is_retryable`] accepts.
pub async fn with_smart_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, operation, is_retryable)
        .await
        .result
}

/// Run `operation` under `policy` and report how it went.
///
/// `should_retry` is consulted for every failure; returning `false` ends the
/// loop immediately with that error.
pub async fn with_retry_outcome<T, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let start = std::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(retries = attempt, "succeeded after retrying");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !should_retry(&e) {
                    debug!(attempt, error = %e, "not retryable, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(attempt, error = %e, "retries exhausted");
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: start.elapsed(),
                        };
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Check if an error is retryable.
///
/// Network failures and server-side statuses are worth another attempt;
/// client errors and malformed data are not.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Io(_) => true,
        Error::Backfill(e) => match e {
            BackfillError::Http(_) => true,
            BackfillError::Status { status, .. } => *status == 429 || *status >= 500,
            BackfillError::Resolve { .. } => false,
            BackfillError::Response(_) => false,
        },
        // Only a busy/locked database is worth retrying; the rest is structural
        Error::Storage(e) => matches!(e, crate::error::StorageError::Database(_)),
        Error::Runtime(_) => true,
        Error::Decode(_)
        | Error::Config(_)
        | Error::InvalidCursor(_)
        | Error::InvalidUri(_)
        | Error::Json(_)
        | Error::Cancelled(_) => false,
    }
}
