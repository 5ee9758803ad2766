//! Bounded retry with exponential backoff.
//!
//! `RetryExecutor` runs an async operation up to `max_retries + 1` times,
//! sleeping between failed attempts. It keeps no state of its own; callers
//! that need a durable record of attempts observe them through
//! [`RetryExecutor::run_observed`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// Retry policy applied to every stage call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Double the delay after each failed attempt
    #[serde(default = "default_exponential")]
    pub exponential: bool,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_exponential() -> bool {
    true
}
fn default_max_delay() -> u64 {
    30000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            exponential: default_exponential(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed)
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let delay = if self.exponential {
            let shift = attempt.saturating_sub(1).min(31);
            self.initial_delay_ms.saturating_mul(1u64 << shift)
        } else {
            self.initial_delay_ms
        };

        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Returned when every attempt failed; carries the last observed error
#[derive(Debug, Error)]
#[error("retries exhausted after {attempts} attempts: {last_error}")]
pub struct RetriesExhausted<E: fmt::Debug + fmt::Display> {
    /// Attempts made (always `max_retries + 1`)
    pub attempts: u32,

    /// Error from the final attempt
    pub last_error: E,
}

/// A failed attempt as seen by an observer
#[derive(Debug)]
pub struct AttemptFailure<'a, E> {
    /// 1-indexed attempt number
    pub attempt: u32,

    pub max_attempts: u32,

    pub error: &'a E,

    /// Delay before the next attempt; `None` when this was the last one
    pub next_delay: Option<Duration>,
}

/// Executes operations under a `RetryPolicy`
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or the attempts are exhausted
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, RetriesExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        self.run_observed(operation, |_| {}).await
    }

    /// Like [`run`](Self::run), reporting every failed attempt to `observer`
    /// before the backoff sleep (or before giving up).
    pub async fn run_observed<T, E, F, Fut, O>(
        &self,
        mut operation: F,
        mut observer: O,
    ) -> Result<T, RetriesExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
        O: FnMut(&AttemptFailure<'_, E>),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt < max_attempts {
                let delay = self.policy.delay_after_attempt(attempt);

                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                observer(&AttemptFailure {
                    attempt,
                    max_attempts,
                    error: &error,
                    next_delay: Some(delay),
                });

                tokio::time::sleep(delay).await;
                continue;
            }

            error!(attempt, max_attempts, error = %error, "Max retries exceeded");
            observer(&AttemptFailure {
                attempt,
                max_attempts,
                error: &error,
                next_delay: None,
            });

            return Err(RetriesExhausted {
                attempts: attempt,
                last_error: error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_double() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            ..Default::default()
        };

        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_after_attempt(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_after_attempt(60), Duration::from_millis(5000));
    }

    #[test]
    fn test_constant_delay() {
        let policy = RetryPolicy {
            exponential: false,
            initial_delay_ms: 250,
            ..Default::default()
        };

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn test_policy_yaml_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_retries: 5").unwrap();

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert!(policy.exponential);
    }
}
