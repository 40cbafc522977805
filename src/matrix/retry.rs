//! Homeserver request retry with exponential backoff.
//!
//! Used while waiting for the homeserver during startup: connection refused or
//! a 5xx while the homeserver boots is transient, a rejected token is not.

use super::traits::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Maximum retry attempts before giving up.
const MAX_RETRIES: u32 = 10;

/// Maximum backoff between two attempts.
const MAX_BACKOFF_SECS: u64 = 60;

/// Backoff before retry number `attempt` (0-based): 2^n seconds, capped.
pub fn backoff_for(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `MAX_RETRIES` retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt >= MAX_RETRIES {
                    return Err(err);
                }

                let backoff = backoff_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    error = %err,
                    "Connection to homeserver failed, retrying in {}",
                    humantime::format_duration(backoff)
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Network failures and homeserver 5xx are transient.
pub fn is_transport_error_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::Network(_) => true,
        TransportError::Matrix { status, .. } => *status >= 500,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result = retry_with_backoff(
            || async { Ok::<_, TransportError>(42) },
            is_transport_error_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    let count = attempt.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(TransportError::Network("connection refused".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            is_transport_error_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error_fails_immediately() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(TransportError::Matrix {
                        status: 401,
                        errcode: "M_UNKNOWN_TOKEN".to_string(),
                        message: "Unknown token".to_string(),
                    })
                }
            },
            is_transport_error_retryable,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_max_retries() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TransportError::Network("down".to_string()))
                }
            },
            is_transport_error_retryable,
        )
        .await;

        assert!(matches!(result, Err(TransportError::Network(_))));
        assert_eq!(attempt.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(3), Duration::from_secs(8));
        assert_eq!(backoff_for(6), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(backoff_for(40), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_is_transport_error_retryable() {
        assert!(is_transport_error_retryable(&TransportError::Network(
            "timeout".to_string()
        )));
        assert!(is_transport_error_retryable(&TransportError::Matrix {
            status: 502,
            errcode: "M_UNKNOWN".to_string(),
            message: "Bad gateway".to_string(),
        }));
        assert!(!is_transport_error_retryable(&TransportError::Matrix {
            status: 403,
            errcode: "M_FORBIDDEN".to_string(),
            message: "Forbidden".to_string(),
        }));
        assert!(!is_transport_error_retryable(&TransportError::Config(
            "bad url".to_string()
        )));
    }
}
