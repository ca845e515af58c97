//! Bounded retry with exponential backoff.
//!
//! Every unreliable call that is safe to repeat goes through
//! [`execute_with_retry`]; nothing else in the workspace loops on failure.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::Error;

/// Errors that know whether repeating the call can help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for Error {
    fn is_transient(&self) -> bool {
        Error::is_transient(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
/// The last error is returned when attempts run out.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(operation, attempt, error = %err, "Retries exhausted");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::Service;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = policy(5);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(250));
        assert_eq!(p.delay_after(30), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<&str, Error> = execute_with_retry(&policy(3), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Error::transient(Service::Reasoning, "rate limited"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error_after_backoff() {
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), Error> = execute_with_retry(&policy(4), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(Error::transient(Service::Vcs, format!("timeout #{n}"))) }
        })
        .await;
        match result {
            Err(Error::Transient { message, .. }) => assert_eq!(message, "timeout #4"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 100 + 200 + 250
        assert!(started.elapsed() >= Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), Error> = execute_with_retry(&policy(5), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::parse("Analysis", "expected object", "nope")) }
        })
        .await;
        assert!(matches!(result, Err(Error::Parse { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        attempts.store(0, Ordering::SeqCst);
        let result: Result<(), Error> = execute_with_retry(&policy(5), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Provider {
                    status: 401,
                    message: "invalid api key".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Provider { status: 401, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let attempts = AtomicU32::new(0);
        let _: Result<(), Error> = execute_with_retry(&policy(0), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::transient(Service::Store, "busy")) }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
