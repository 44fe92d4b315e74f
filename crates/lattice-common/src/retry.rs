//! Bounded in-place retries for transient mesh API failures.
//!
//! Throttling is absorbed here with a few short, jittered sleeps. Anything
//! that outlives the attempt budget goes back to the controller as a requeue,
//! so these delays stay well under a reconcile's time budget.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Attempt budget and delay curve for one call
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first; at least one is always made
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default curve with the given attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay before attempt `n + 1`, `n` counting from one
    fn base_delay(&self, n: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(n.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Delay before attempt `n + 1`, jittered to 50-150% of the base delay
    fn delay(&self, n: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(n).as_secs_f64() * jitter)
    }
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or the attempt budget is spent. The last error is returned.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let budget = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !is_transient(&err) {
            debug!(operation = %operation_name, error = %err, "permanent failure");
            return Err(err);
        }
        if attempt >= budget {
            warn!(
                operation = %operation_name,
                attempts = attempt,
                error = %err,
                "transient failure outlived the retry budget"
            );
            return Err(err);
        }

        let delay = config.delay(attempt);
        debug!(
            operation = %operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    fn throttled(e: &&str) -> bool {
        *e == "throttled"
    }

    #[test]
    fn delays_grow_then_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(125),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.base_delay(1), Duration::from_millis(125));
        assert_eq!(config.base_delay(2), Duration::from_millis(250));
        assert_eq!(config.base_delay(3), Duration::from_millis(500));
        assert_eq!(config.base_delay(8), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn throttling_is_absorbed_within_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = retry_if(&fast(3), "ListRules", throttled, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("throttled")
                } else {
                    Ok("rules")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("rules"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_if(&fast(2), "CreateRule", throttled, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("throttled") }
        })
        .await;

        assert_eq!(result, Err("throttled"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_if(&fast(5), "CreateService", throttled, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("invalid name") }
        })
        .await;

        assert_eq!(result, Err("invalid name"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_budget_still_makes_one_attempt() {
        let result: Result<u8, &str> =
            retry_if(&fast(0), "GetService", throttled, || async { Ok(1) }).await;
        assert_eq!(result, Ok(1));
    }
}
