// pgphase/src/utils/retry.rs
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::errors::{AppError, Result};

/// Bounded retry with doubling backoff for idempotent remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Wait after the `failed_attempt`-th failure (1-based): base, 2*base, 4*base, ...
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Sum of all waits when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

/// Runs `action` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Errors for which `is_retryable` is false surface immediately as
/// [`AppError::Storage`]; exhausting the budget on retryable errors surfaces as
/// [`AppError::TransientStorage`].
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: P,
    mut action: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match action().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("✓ {} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                return Err(AppError::Storage(format!("{}: {}", operation, e)));
            }
            Err(e) if attempt >= policy.max_attempts => {
                return Err(AppError::TransientStorage {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    "⚠️ {} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    policy.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_backoff_schedule_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.total_backoff(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_exactly_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<()> = retry(&policy, "HEAD db/label.dump", |_: &String| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), String>("connection reset".to_string()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(AppError::TransientStorage { attempts, operation, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(operation, "HEAD db/label.dump");
            }
            other => panic!("expected TransientStorage, got {:?}", other),
        }
        // 1s + 2s under the paused clock.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_millis(3100));
        assert_eq!(policy.total_backoff(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() -> anyhow::Result<()> {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let value = retry(&policy, "GET", |_: &String| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("503 Slow Down".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await?;

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry(&policy, "PUT", |e: &String| e.starts_with("5"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), String>("403 Forbidden".to_string()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::Storage(_))));
    }
}
