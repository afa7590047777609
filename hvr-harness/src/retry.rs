//! Caller-side retry of infrastructure failures.
//!
//! Controllers never retry internally. A caller that wants a second chance
//! after a flaky install, a launch that died on the spot or an unreadable
//! status indicator wraps the whole controller run in [`run_with_retry`].
//! Configuration errors, timeouts and test failures are returned at once.

use std::future::Future;
use std::time::Duration;

use hvr_common::HarnessError;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Errors that can be retried.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for HarnessError {
    fn is_retryable(&self) -> bool {
        HarnessError::is_retryable(self)
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff delay after a failed attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.base_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64().max(0.0);

        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1)) as f64;
        let mut delay = (base_secs * multiplier).min(max_secs);

        if self.jitter > 0.0 && delay > 0.0 {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            delay = (delay * (1.0 + jitter)).max(0.0);
        }

        Duration::from_secs_f64(delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run an async operation, retrying while its error is retryable.
pub async fn run_with_retry<F, Fut, T, E>(label: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        debug!(label, attempt, max_attempts, "Starting attempt");

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(label, attempt, "Attempt succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    label,
                    attempt,
                    error = %err,
                    delay_secs = delay.as_secs_f64(),
                    "Attempt failed with infrastructure error, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(label, attempt, error = %err, retryable = err.is_retryable(), "Attempt failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvr_common::{ConfigError, LaunchError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    fn launch_failure() -> HarnessError {
        HarnessError::from(LaunchError::ExitedImmediately {
            program: "bit.exe".into(),
            code: Some(1),
            grace_ms: 2000,
        })
    }

    #[tokio::test]
    async fn infrastructure_errors_are_retried_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = run_with_retry("burnin", &fast_policy(3), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(launch_failure())
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn config_errors_fail_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32, HarnessError> = run_with_retry("burnin", &fast_policy(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ConfigError::new("burnin", vec![]).into())
            }
        })
        .await;

        assert!(matches!(result, Err(HarnessError::Config(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), HarnessError> = run_with_retry("smart", &fast_policy(2), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(launch_failure())
            }
        })
        .await;

        assert!(result.unwrap_err().is_infrastructure());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = policy.backoff_delay(1).as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "delay {d} out of bounds");
        }
    }

    #[test]
    fn none_policy_runs_once() {
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }
}
