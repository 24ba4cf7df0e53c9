//! In-process retries for short collaborator hiccups, and log throttling for
//! background loops.
//!
//! Job-level retries live in [`crate::retry_manager`].

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// `base * 2^exponent`, capped at `cap`.
pub fn exponential_delay(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first call
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Name used in log lines
    pub operation: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            operation: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sleep before retry number `retry` (1-based).
    fn delay_before(&self, retry: u32) -> Duration {
        exponential_delay(self.base_delay, retry, self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Retries exhausted, or the error was not worth retrying
    Failed { error: E, attempts: u32 },
}

/// Call `operation` until it succeeds, retrying only errors accepted by
/// `retryable`.
pub async fn retry_if<F, Fut, T, E, P>(config: &RetryConfig, retryable: P, operation: F) -> RetryResult<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0u32;
    loop {
        let error = match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => e,
        };
        if retries >= config.max_retries || !retryable(&error) {
            return RetryResult::Failed {
                error,
                attempts: retries + 1,
            };
        }
        retries += 1;
        let delay = config.delay_before(retries);
        debug!(
            operation = %config.operation,
            retry = retries,
            ?delay,
            "Retrying after error: {}",
            error
        );
        tokio::time::sleep(delay).await;
    }
}

/// Counts consecutive failures of a background loop and tells it whether to
/// log the next one. After `max_logged` failures in a row the loop goes quiet
/// until a success.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive: u32,
    max_logged: u32,
}

impl FailureTracker {
    pub fn new(max_logged: u32) -> Self {
        Self {
            consecutive: 0,
            max_logged,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive > self.max_logged {
            debug!(failures = self.consecutive, "Recovered after suppressed failures");
        }
        self.consecutive = 0;
    }

    /// Returns whether this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive == self.max_logged + 1 {
            warn!(
                failures = self.max_logged,
                "Suppressing further failure logs until recovery"
            );
        }
        self.consecutive <= self.max_logged
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new("test").with_base_delay(Duration::from_millis(100));

        assert_eq!(config.delay_before(1), Duration::from_millis(200));
        assert_eq!(config.delay_before(2), Duration::from_millis(400));
        assert_eq!(config.delay_before(3), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_delay_caps_and_never_overflows() {
        let cap = Duration::from_secs(5);
        assert_eq!(exponential_delay(Duration::from_secs(1), 10, cap), cap);
        assert_eq!(exponential_delay(Duration::from_secs(1), 64, cap), cap);
    }

    #[test]
    fn test_failure_tracker_suppression() {
        let mut tracker = FailureTracker::new(3);

        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(tracker.record_failure());

        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());

        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_permanent_error() {
        let config = RetryConfig::new("test").with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = retry_if(
            &config,
            |e: &&str| *e != "malformed",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("malformed") }
            },
        )
        .await;

        assert!(matches!(result, RetryResult::Failed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_if_recovers_from_transient_errors() {
        let config = RetryConfig::new("test").with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = retry_if(&config, |_: &&str| true, || {
            let count = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err("connection reset")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(matches!(result, RetryResult::Success(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_gives_up_after_max_retries() {
        let config = RetryConfig::new("test")
            .with_base_delay(Duration::from_millis(1))
            .with_max_retries(2);

        let result = retry_if(&config, |_: &&str| true, || async { Err::<(), _>("down") }).await;
        assert!(matches!(result, RetryResult::Failed { attempts: 3, .. }));
    }
}
