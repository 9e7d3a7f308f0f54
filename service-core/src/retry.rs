//! Retry utilities for transient failures.
//!
//! A [`RetryPolicy`] decides how many attempts an operation gets and how long
//! to wait between them; [`retry_async`] drives an async operation under it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// How the delay grows between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// `base_delay * n` after the n-th failed attempt.
    Linear,
    /// `base_delay * 2^(n-1)`, capped at `max_delay`.
    Exponential,
}

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit used by the backoff function.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// Linear policy with the given attempt budget and delay unit.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Same attempt budget, but never sleeps. Used by tests.
    pub fn without_delay(max_attempts: u32) -> Self {
        Self::linear(max_attempts, Duration::ZERO)
    }

    /// Delay to wait after `failed_attempt` (1-based) before the next try.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let attempt = failed_attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Why a retried operation finally failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error the classifier rejected.
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(err) => err,
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy runs out of
/// attempts. `f` receives the 1-based attempt number.
pub async fn retry_async<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: C,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryError::Permanent(err));
                }

                if attempt >= max_attempts {
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %err,
                    backoff_ms = delay.as_millis() as u64,
                    "Operation failed, retrying after backoff"
                );

                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
