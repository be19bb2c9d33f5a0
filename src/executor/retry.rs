//! Retry policy for provider calls.
//!
//! Transient provider errors are retried with exponential backoff; every
//! other error fails on the first attempt.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::ProviderError;

/// Backoff settings for provider calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy from engine settings.
    #[must_use]
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            max_attempts: engine.max_attempts.max(1),
            initial_delay: Duration::from_millis(engine.initial_backoff_ms),
            max_delay: Duration::from_millis(engine.max_backoff_ms),
            factor: 2.0,
        }
    }

    /// Policy without delays, used by tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 2.0,
        }
    }

    // Jitter is added on top of the capped delay, so cap again after it.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(max_delay)
            .with_factor(self.factor)
            .with_jitter()
            .with_max_times(retries(self.max_attempts))
            .build()
            .map(move |delay| delay.min(max_delay))
    }

    /// Runs `call` until it succeeds, fails permanently, or the attempts
    /// run out.
    ///
    /// Returns the value with the number of attempts made.
    ///
    /// # Errors
    ///
    /// Returns the last provider error with the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        mut call: F,
    ) -> Result<(T, u32), (ProviderError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut delays = self.backoff();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match call().await {
                Ok(value) => return Ok((value, attempts)),
                Err(e) => e,
            };
            if !error.is_retryable() {
                return Err((error, attempts));
            }
            let Some(computed) = delays.next() else {
                return Err((error, attempts));
            };
            let delay = error
                .retry_delay()
                .map_or(computed, |hint| hint.min(self.max_delay));
            warn!(
                operation = what,
                attempt = attempts,
                delay = ?delay,
                error = %error,
                "Transient provider error, retrying..."
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn retries(max_attempts: u32) -> usize {
    usize::try_from(max_attempts.saturating_sub(1)).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_transient_errors_are_retried_to_the_bound() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<((), u32), _> = RetryPolicy::immediate(3)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::network("connection reset"))
            })
            .await;

        let (error, attempts) = result.expect_err("should fail");
        assert_eq!(attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_at_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<((), u32), _> = RetryPolicy::immediate(5)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::validation("bad cidr"))
            })
            .await;

        assert_eq!(result.expect_err("should fail").1, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(5)
            .run("test", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::RateLimited {
                        retry_after_ms: Some(0),
                    })
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.expect("should succeed"), ("done", 3));
    }

    #[test]
    fn test_delays_never_exceed_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 12,
            initial_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(100),
            factor: 2.0,
        };
        for _ in 0..20 {
            let delays: Vec<Duration> = policy.backoff().collect();
            assert_eq!(delays.len(), 11);
            assert!(delays.iter().all(|d| *d <= policy.max_delay), "{delays:?}");
        }
    }

    #[test]
    fn test_policy_from_engine() {
        let policy = RetryPolicy::from_engine(&EngineConfig::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }
}
