//! Bounded retry with exponential backoff.
//!
//! Stateless: all logic lives in associated functions on `RetryHandler` that
//! take the `RetryPolicy` as a parameter. Attempts are 1-based; there is no
//! delay before the first attempt, and the delay before attempt `k + 1` is
//! `min(backoffMs * backoffMultiplier^(k - 1), maxBackoffMs)`.

use std::future::Future;
use std::time::Duration;

use sagaflow_types::workflow::RetryPolicy;
use serde_json::Value;

use super::adapter::TaskError;

/// A retry about to happen, reported before the backoff sleep.
#[derive(Debug, Clone, Copy)]
pub struct RetryNotice<'a> {
    /// The attempt that will run after the delay (2 for the first retry).
    pub next_attempt: u32,
    pub delay: Duration,
    pub error: &'a TaskError,
}

/// Final result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<Value, TaskError>,
    pub attempts: u32,
}

/// Stateless retry handler for task invocations.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether `error` matches the policy's retryable markers.
    ///
    /// With no `retryableErrors` every error is retryable. Otherwise a marker
    /// matches when the error code equals or contains it, or the message
    /// contains it.
    pub fn is_retryable(policy: &RetryPolicy, error: &TaskError) -> bool {
        let Some(markers) = &policy.retryable_errors else {
            return true;
        };
        markers.iter().any(|marker| {
            error
                .code
                .as_deref()
                .is_some_and(|code| code.contains(marker.as_str()))
                || error.message.contains(marker.as_str())
        })
    }

    /// Whether another attempt should follow failed attempt `attempt`.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &TaskError) -> bool {
        attempt < policy.max_attempts.max(1) && Self::is_retryable(policy, error)
    }

    /// Delay after failed attempt `failed_attempt` (1-based).
    pub fn backoff_delay(policy: &RetryPolicy, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(policy.max_backoff_ms as f64)
        } else {
            policy.max_backoff_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Drive `op` until it succeeds, the error is not retryable, or attempts
    /// run out. `op` receives the 1-based attempt number. The last error is
    /// returned unchanged.
    pub async fn run<F, Fut, N>(policy: &RetryPolicy, mut op: F, mut on_retry: N) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
        N: FnMut(RetryNotice<'_>),
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if !Self::should_retry(policy, attempt, &error) {
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                        };
                    }
                    let delay = Self::backoff_delay(policy, attempt);
                    on_retry(RetryNotice {
                        next_attempt: attempt + 1,
                        delay,
                        error: &error,
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn policy(max_attempts: u32, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_backoff_sequence_doubles() {
        let p = policy(4, 100);
        let delays: Vec<u64> = (1..=3)
            .map(|k| RetryHandler::backoff_delay(&p, k).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy {
            max_attempts: 10,
            backoff_ms: 1000,
            backoff_multiplier: 3.0,
            max_backoff_ms: 5000,
            retryable_errors: None,
        };
        assert_eq!(RetryHandler::backoff_delay(&p, 2), Duration::from_millis(3000));
        assert_eq!(RetryHandler::backoff_delay(&p, 3), Duration::from_millis(5000));
        assert_eq!(RetryHandler::backoff_delay(&p, 400), Duration::from_millis(5000));
    }

    #[test]
    fn test_retryable_markers() {
        let p = RetryPolicy {
            retryable_errors: Some(vec!["TIMEOUT".to_string(), "rate limit".to_string()]),
            ..policy(3, 10)
        };
        assert!(RetryHandler::is_retryable(&p, &TaskError::timeout(5)));
        assert!(RetryHandler::is_retryable(
            &p,
            &TaskError::failed("upstream rate limit hit")
        ));
        assert!(!RetryHandler::is_retryable(
            &p,
            &TaskError::with_code("CARD_DECLINED", "card declined")
        ));
        assert!(RetryHandler::is_retryable(&policy(3, 10), &TaskError::failed("anything")));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let p = policy(3, 10);
        let err = TaskError::failed("x");
        assert!(RetryHandler::should_retry(&p, 1, &err));
        assert!(RetryHandler::should_retry(&p, 2, &err));
        assert!(!RetryHandler::should_retry(&p, 3, &err));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let p = policy(4, 5);
        let notices = Mutex::new(Vec::new());
        let outcome = RetryHandler::run(
            &p,
            |attempt| async move {
                if attempt < 3 {
                    Err(TaskError::failed(format!("fail {attempt}")))
                } else {
                    Ok(serde_json::json!({"attempt": attempt}))
                }
            },
            |notice| {
                notices
                    .lock()
                    .unwrap()
                    .push((notice.next_attempt, notice.delay.as_millis() as u64));
            },
        )
        .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap()["attempt"], 3);
        assert_eq!(*notices.lock().unwrap(), vec![(2, 5), (3, 10)]);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let p = policy(3, 1);
        let outcome = RetryHandler::run(
            &p,
            |attempt| async move { Err(TaskError::with_code("E", format!("fail {attempt}"))) },
            |_| {},
        )
        .await;
        assert_eq!(outcome.attempts, 3);
        let err = outcome.result.unwrap_err();
        assert_eq!(err, TaskError::with_code("E", "fail 3"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let p = RetryPolicy {
            retryable_errors: Some(vec!["TIMEOUT".to_string()]),
            ..policy(5, 1)
        };
        let mut calls = 0;
        let outcome = RetryHandler::run(
            &p,
            |_| {
                calls += 1;
                async { Err(TaskError::failed("validation failed")) }
            },
            |_| panic!("must not retry"),
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls, 1);
    }
}
