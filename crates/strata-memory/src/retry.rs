//! Retry with exponential backoff for transient backend failures.
//!
//! Only [`MemoryError::is_retryable`] errors are retried. Validation,
//! corruption and timeouts surface on the first attempt.
//!
//! # Example
//!
//! ```
//! use strata_memory::RetryConfig;
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, 2);
//!
//! let none = RetryConfig::none();
//! assert_eq!(none.max_retries, 0);
//! ```

use std::future::Future;
use std::time::Duration;

use strata_config::RetrySection;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;

/// Backoff policy for one backend call.
///
/// `max_retries` counts attempts after the first, so a call runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl RetryConfig {
    /// Quick retry for individual reads: fail to the caller fast.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Longer backoff for restore paths that must not give up early.
    #[must_use]
    pub fn persistent() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// Single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Next backoff step, capped at `max_delay`. A product that overflows
    /// `Duration` saturates to the cap.
    fn next_delay(&self, delay: Duration) -> Duration {
        // `f64::max` ignores NaN.
        let factor = self.factor.max(1.0);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            factor: section.factor,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `config.max_retries`.
pub async fn retry<F, Fut, T>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if retries > 0 {
                    info!(operation = operation_name, retries, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && retries < config.max_retries => {
                retries += 1;
                warn!(
                    operation = operation_name,
                    attempt = retries,
                    max_retries = config.max_retries,
                    error = %err,
                    "Operation failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry("op", &fast(3), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry("op", &fast(3), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(MemoryError::storage("b", format!("fail {n}")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry("op", &fast(2), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::storage("b", "always"))
            }
        })
        .await;

        assert!(matches!(result, Err(MemoryError::Storage { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_corruption_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry("op", &fast(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::corruption("b", "bad page"))
            }
        })
        .await;

        assert!(matches!(result, Err(MemoryError::Corruption { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_backoff_caps_at_max() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            factor: 2.0,
        };
        let second = config.next_delay(config.initial_delay);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(config.next_delay(second), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_survives_extreme_factors() {
        let base = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            factor: f64::INFINITY,
        };
        assert_eq!(base.next_delay(base.initial_delay), Duration::from_millis(40));

        let nan = RetryConfig {
            factor: f64::NAN,
            ..base.clone()
        };
        assert_eq!(nan.next_delay(nan.initial_delay), Duration::from_millis(10));

        let huge = RetryConfig {
            factor: f64::MAX,
            ..base
        };
        assert_eq!(huge.next_delay(Duration::from_secs(1)), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_retry_with_unbounded_factor_does_not_panic() {
        let config = RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: f64::INFINITY,
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry("op", &config, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::storage("b", "injected"))
            }
        })
        .await;

        assert!(matches!(result, Err(MemoryError::Storage { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_from_section() {
        let config = RetryConfig::from(&RetrySection::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(5));
    }
}
