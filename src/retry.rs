// Retry with exponential backoff and jitter for retryable store conflicts
// (lock timeouts, serialization failures). Business rejections are returned immediately.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    // Jitter spreads competing writers for the same room apart
    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

pub async fn retry_on_conflict<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let backoff = calculate_backoff(attempt, config);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retrying after concurrency conflict"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BookingError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(50));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff(10, &config), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let config = RetryConfig {
            initial_backoff_ms: 1,
            ..RetryConfig::default()
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = retry_on_conflict(&config, "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BookingError::ConcurrencyConflict("lock timeout".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = retry_on_conflict(&RetryConfig::default(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BookingError::Forbidden("not the owner".into()))
        })
        .await;

        assert!(matches!(result, Err(BookingError::Forbidden(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let config = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            ..RetryConfig::default()
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = retry_on_conflict(&config, "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BookingError::ConcurrencyConflict("deadlock".into()))
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
