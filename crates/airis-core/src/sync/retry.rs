//! Retry with exponential backoff and per-operation timeouts

use std::future::Future;
use std::time::Duration;

use crate::config::{RetrySettings, TimeoutSettings};

use super::remote::RemoteError;

/// Kind of remote operation, selecting its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Default,
    /// Fetching and pushing metadata
    Sync,
    /// Pushes carrying book content
    Upload,
}

/// Backoff and timeout settings for remote calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub timeouts: TimeoutSettings,
}

impl RetryPolicy {
    pub fn new(retry: &RetrySettings, timeouts: &TimeoutSettings) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            base_delay: Duration::from_millis(retry.base_delay_ms),
            multiplier: retry.multiplier,
            timeouts: timeouts.clone(),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        self.base_delay.mul_f64(factor)
    }

    pub fn timeout_for(&self, class: OperationClass) -> Duration {
        let ms = match class {
            OperationClass::Default => self.timeouts.default_ms,
            OperationClass::Sync => self.timeouts.sync_ms,
            OperationClass::Upload => self.timeouts.upload_ms,
        };
        Duration::from_millis(ms)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts
    ///
    /// Each attempt is bounded by the timeout of `class`; an elapsed timeout
    /// counts as a transient failure. Returns the last error.
    pub async fn run<T, F, Fut>(&self, class: OperationClass, mut operation: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let limit = self.timeout_for(class);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(limit)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default(), &TimeoutSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            timeouts: TimeoutSettings {
                default_ms: 1_000,
                sync_ms: 2_000,
                upload_ms: 5_000,
            },
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_timeout_per_class() {
        let policy = policy(1);
        assert_eq!(policy.timeout_for(OperationClass::Default), Duration::from_secs(1));
        assert_eq!(policy.timeout_for(OperationClass::Sync), Duration::from_secs(2));
        assert_eq!(policy.timeout_for(OperationClass::Upload), Duration::from_secs(5));
    }

    #[test]
    fn test_from_settings_never_zero_attempts() {
        let retry = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        let policy = RetryPolicy::new(&retry, &TimeoutSettings::default());
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy(3)
            .run(OperationClass::Sync, || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RemoteError::Network("offline".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = policy(3)
            .run(OperationClass::Sync, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RemoteError::Server {
                        status: 503,
                        message: "down".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Server { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = policy(3)
            .run(OperationClass::Default, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RemoteError::Rejected {
                        status: 401,
                        message: "unauthorized".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let result: Result<(), _> = policy(2)
            .run(OperationClass::Default, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(RemoteError::Timeout(Duration::from_secs(1))));
    }
}
