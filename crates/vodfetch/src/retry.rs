// Retry utility: shared retry-with-backoff loop for segment and init fetches.
//
// Backoff is linear: the wait before retry `k` (1-indexed) is `k * delay_unit`.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{FetchAttemptError, FetchError};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Backoff unit. Actual delay = unit * retry number.
    pub delay_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_unit: Duration) -> Self {
        Self {
            max_retries,
            delay_unit,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.delay_unit.checked_mul(retry).unwrap_or(Duration::MAX)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Failed with a retryable error (network, non-2xx, local read).
    Retry(FetchAttemptError),
    /// Failed with an error no retry can fix.
    Fail(FetchAttemptError),
}

impl<T> From<Result<T, FetchAttemptError>> for RetryAction<T> {
    fn from(result: Result<T, FetchAttemptError>) -> Self {
        match result {
            Ok(value) => RetryAction::Success(value),
            Err(err) if err.is_retryable() => RetryAction::Retry(err),
            Err(err) => RetryAction::Fail(err),
        }
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed).
/// Up to `max_retries + 1` attempts are made; the last attempt's error is
/// carried by [`FetchError::Exhausted`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    location: &str,
    token: &CancellationToken,
    operation: F,
) -> Result<T, FetchError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(source) => {
                return Err(FetchError::Rejected {
                    location: location.to_string(),
                    source,
                });
            }
            RetryAction::Retry(source) => {
                if attempt >= policy.max_retries {
                    return Err(FetchError::Exhausted {
                        location: location.to_string(),
                        attempts: attempt + 1,
                        source,
                    });
                }
                attempt += 1;
                let delay = policy.delay_for_retry(attempt);
                warn!(
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    location,
                    error = %source,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(FetchError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> FetchAttemptError {
        FetchAttemptError::http_status(StatusCode::INTERNAL_SERVER_ERROR, "http://host/seg.ts")
    }

    #[test]
    fn delay_is_linear_in_retry_number() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(u32::MAX, Duration::MAX);
        assert_eq!(policy.delay_for_retry(2), Duration::MAX);
    }

    #[tokio::test]
    async fn retry_succeeds_on_first_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let token = CancellationToken::new();
        let result =
            retry_with_backoff(&policy, "a.ts", &token, |_| async { RetryAction::Success(42u32) })
                .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_fails_immediately_on_non_retryable() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy, "::bad", &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Fail(FetchAttemptError::invalid_location("::bad", "no scheme")) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Rejected { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_then_fails_with_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<u32, _> = retry_with_backoff(&policy, "seg.ts", &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(server_error()) }
        })
        .await;

        // Initial attempt + 2 retries = 3 total, waiting 1s then 2s.
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
        match result {
            Err(FetchError::Exhausted {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, FetchAttemptError::HttpStatus { .. }));
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(&policy, "seg.ts", &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt == 0 {
                    RetryAction::Retry(server_error())
                } else {
                    RetryAction::Success(99u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn retry_respects_cancellation() {
        let policy = RetryPolicy::new(10, Duration::from_secs(100));
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> =
            retry_with_backoff(&policy, "seg.ts", &token, |_| async { RetryAction::Success(1u32) })
                .await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
