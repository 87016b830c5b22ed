//! Retry utilities.
//!
//! The helpers in this module are transport-agnostic and are used when channel
//! creation races the websocket handshake: attempts that fail because the
//! connection is still establishing are retried with bounded exponential
//! backoff, while any other failure stops the loop immediately.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Returns the default policy for opening a channel on a fresh connection.
    ///
    /// Five attempts with delays of 1s, 2s, 4s, then 5s, enough to outlast a
    /// normal websocket handshake without hammering the service.
    pub fn channel_open() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::channel_open()
    }
}

/// Failure outcome of [`retry_async`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RetryError<E> {
    /// The operation failed with an error classified as not retryable.
    #[error("non-retryable error: {0}")]
    Fatal(E),
    /// Every allowed attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made, including the first.
        attempts: usize,
        /// Error returned by the final attempt.
        last: E,
    },
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable; a rejected error is returned as [`RetryError::Fatal`]
/// without sleeping, even on the final attempt.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !should_retry(&error) {
                    return Err(RetryError::Fatal(error));
                }
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: max_attempts,
                        last: error,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    unreachable!("max_attempts is always at least 1")
}
