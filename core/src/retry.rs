//! Retry policy with exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value: attempt limit, cumulative time
//! budget, backoff curve and a give-up predicate. [`RetryPolicy::run`] wraps
//! a fallible async operation with it.

use crate::config::RetryConfig;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Predicate deciding that an error must not be retried.
pub type GiveUp<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// `initial * multiplier^(n-1)` after the n-th failure, capped at `max_delay`
/// and never below zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max_delay,
        }
    }

    /// Wait before the attempt following failure number `failed_attempt`
    /// (1-based).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub backoff: ExponentialBackoff,
    give_up: GiveUp<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            max_elapsed: self.max_elapsed,
            backoff: self.backoff,
            give_up: self.give_up.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E> {
    /// Policy that retries every error.
    pub fn new(max_attempts: u32, max_elapsed: Duration, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_elapsed,
            backoff,
            give_up: Arc::new(|_| false),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.max_elapsed_secs),
            ExponentialBackoff::new(
                Duration::from_millis(config.initial_delay_ms),
                config.multiplier,
                Duration::from_millis(config.max_delay_ms),
            ),
        )
    }

    pub fn with_give_up<F>(mut self, give_up: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.give_up = Arc::new(give_up);
        self
    }

    pub fn should_give_up(&self, error: &E) -> bool {
        (self.give_up)(error)
    }
}

impl<E: fmt::Display> RetryPolicy<E> {
    /// Run `op` until it succeeds, the give-up predicate matches, the
    /// attempt limit is reached, or the time budget is spent. The last error
    /// is returned unchanged.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if self.should_give_up(&error) {
                warn!(attempt, error = %error, "Giving up without retry");
                return Err(error);
            }
            if attempt >= self.max_attempts {
                warn!(attempt, error = %error, "Retry attempts exhausted");
                return Err(error);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.max_elapsed {
                warn!(
                    attempt,
                    elapsed_secs = elapsed.as_secs_f64(),
                    error = %error,
                    "Retry time budget exhausted"
                );
                return Err(error);
            }

            let wait = self.backoff.delay(attempt).min(self.max_elapsed - elapsed);
            debug!(
                attempt,
                wait_secs = wait.as_secs_f64(),
                error = %error,
                "Backing off before retry"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy<String> {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(5),
            ExponentialBackoff::new(Duration::from_millis(1), 2.0, Duration::from_millis(4)),
        )
    }

    #[test]
    fn test_backoff_curve() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn test_negative_multiplier_never_yields_negative_delay() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(1), -2.0, Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::ZERO);
        assert_eq!(backoff.delay(3), Duration::from_secs(4));

        let policy: RetryPolicy<String> = RetryPolicy::new(3, Duration::from_secs(1), backoff);
        assert_eq!(policy.backoff.delay(4), Duration::ZERO);
    }

    #[test]
    fn test_policy_from_default_config() {
        let policy: RetryPolicy<String> = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 20);
        assert_eq!(policy.max_elapsed, Duration::from_secs(600));
        assert_eq!(policy.backoff.delay(1), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(10)
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt <= 3 {
                        Err(format!("transient failure {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stops_at_attempt_limit_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_policy(3)
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {}", attempt)) }
            })
            .await;
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_give_up_predicate_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(20).with_give_up(|e: &String| e.contains("Token error"));
        let result: Result<(), String> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("Token error: invalid_grant".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_time_budget_limits_attempts() {
        let policy: RetryPolicy<String> = RetryPolicy::new(
            1000,
            Duration::from_millis(50),
            ExponentialBackoff::new(Duration::from_millis(20), 1.0, Duration::from_millis(20)),
        );
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), String> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unavailable".to_string()) }
            })
            .await;
        assert!(result.is_err());
        let calls = calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected at least one retry, got {}", calls);
        assert!(calls < 10, "budget should cap attempts, got {}", calls);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
