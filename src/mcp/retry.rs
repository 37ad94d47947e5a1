//! Retry Logic and Error Resilience
//!
//! Exponential backoff with jitter for broker operations. Only errors that
//! [`BrokerError::is_transient`] classifies as transient are retried; an
//! authorization failure or a remote tool error fails on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use mcp_broker::mcp::retry::{RetryConfig, retry_with_backoff};
//!
//! let config = RetryConfig::default()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(5));
//!
//! let result = retry_with_backoff(&config, || {
//!     manager.call_tool_by_full_name("echo__ping", json!({}), None, None)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::mcp::error::{BrokerError, BrokerResult};

/// Retry configuration
///
/// * `max_attempts` - attempts including the first one (default: 3)
/// * `base_delay` - delay before the first retry (default: 100ms)
/// * `max_delay` - cap on any single delay (default: 5s)
/// * `jitter` - random variation factor (default: 0.1 = 10%)
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: usize,

    /// Base delay before first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration that makes exactly one attempt
    pub fn none() -> Self {
        Self::default().max_attempts(1)
    }

    /// Set the maximum number of attempts; at least one is always made
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay between retries
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between retries
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after `attempt` (zero-based) failed
    ///
    /// `base_delay * 2^attempt`, plus up to `jitter` of itself, capped at
    /// `max_delay`.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31) as u32);
        let exponential_delay = self.base_delay.saturating_mul(factor);

        let jitter_range = exponential_delay.mul_f64(self.jitter);
        let jitter_offset = jitter_range.mul_f64(rand::random::<f64>());

        exponential_delay
            .saturating_add(jitter_offset)
            .min(self.max_delay)
    }

    /// Whether `error` is worth another attempt
    pub fn should_retry_error(&self, error: &BrokerError) -> bool {
        error.is_transient()
    }
}

/// Retry an operation with exponential backoff
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, T, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("Operation succeeded on attempt {}", attempt + 1);
                }
                return Ok(result);
            }
            Err(e) if attempt + 1 < max_attempts && config.should_retry_error(&e) => {
                let delay = config.calculate_delay(attempt);
                tracing::warn!(
                    "Attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!("Operation failed after {} attempts: {}", attempt + 1, e);
                }
                return Err(e);
            }
        }
    }
}
