// ABOUTME: Bounded retry-with-backoff primitive for readiness polling
// ABOUTME: Shared by remote machine provisioning and IDE startup probes

use crate::error::SandboxError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Attempt budget and backoff schedule for a polling loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Each attempt is abandoned (and counted as not ready) past this bound
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Fixed interval between attempts.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Why a polling loop gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Budget spent without a ready answer
    Exhausted {
        attempts: u32,
        last_error: Option<SandboxError>,
    },
    /// An attempt failed with an error that must not be retried
    Aborted(SandboxError),
}

/// Poll `attempt` until it yields `Some`, following `policy`.
///
/// `Ok(None)`, a retryable error, or an attempt exceeding `attempt_timeout`
/// count as "not ready yet". A non-retryable error stops the loop at once.
pub async fn poll_until<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut attempt: F,
) -> std::result::Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, SandboxError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for n in 1..=max_attempts {
        match tokio::time::timeout(policy.attempt_timeout, attempt(n)).await {
            Ok(Ok(Some(value))) => {
                debug!(label = label, attempt = n, "ready");
                return Ok(value);
            }
            Ok(Ok(None)) => {
                debug!(label = label, attempt = n, "not ready");
            }
            Ok(Err(e)) if e.is_retryable() => {
                debug!(label = label, attempt = n, error = %e, "attempt failed, retrying");
                last_error = Some(e);
            }
            Ok(Err(e)) => return Err(RetryError::Aborted(e)),
            Err(_) => {
                debug!(label = label, attempt = n, "attempt timed out");
            }
        }

        if n < max_attempts {
            tokio::time::sleep(policy.delay_after(n)).await;
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = quick_policy(10);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(9), Duration::from_millis(400));
    }

    #[test]
    fn test_fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(750));
        assert_eq!(policy.delay_after(1), policy.delay_after(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_ready_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = poll_until(&quick_policy(5), "test", |n| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(if n == 3 { Some("ready") } else { None })
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let result: Result<(), _> = poll_until(&quick_policy(4), "test", |_| async {
            Err(SandboxError::BackendUnavailable("connection refused".into()))
        })
        .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(
                    last_error,
                    Some(SandboxError::BackendUnavailable(_))
                ));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = poll_until(&quick_policy(10), "test", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SandboxError::Configuration("bad image".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Aborted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_counts_as_not_ready() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(50),
            ..quick_policy(2)
        };

        let result: Result<(), _> = poll_until(&policy, "test", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(()))
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 2, .. })
        ));
    }
}
