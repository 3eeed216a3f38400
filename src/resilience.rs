//! Retry and backoff configuration.
//!
//! [`RetryConfig`] drives two loops:
//!
//! - the orchestration retry inside [`SyncPolicy`](crate::policy::SyncPolicy)
//!   (`max_attempts` total attempts, `initial_delay × factor^(n-1)` between them)
//! - startup connection attempts to Redis (`connection_timeout` per attempt)
//!
//! # Example
//!
//! ```rust
//! use rfq_sync::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::testing();
//! assert!(retry.delay_for_attempt(2) > retry.delay_for_attempt(1));
//! assert!(retry.delay_for_attempt(50) <= Duration::from_millis(100));
//! ```

use crate::config::RetrySettings;
use std::time::Duration;

/// Retry behavior for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Startup connection retry: fail within roughly half a minute so a
    /// misconfigured URL is noticed quickly.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// ...
    /// 10       ~19s
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            // Out-of-range values are rejected by `SyncConfig::validate`;
            // saturate here so a hand-built setting cannot panic.
            initial_delay: Duration::try_from_secs_f64(settings.multiplier_secs)
                .unwrap_or(Duration::from_secs(settings.max_wait_secs)),
            max_delay: Duration::from_secs(settings.max_wait_secs),
            ..Self::default()
        }
    }
}
