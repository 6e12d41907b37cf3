//! Retry with fixed or backoff delays.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::Result;
use crate::options::{Options, defaults};

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts.
    Fixed(Duration),
    /// Exponential backoff with configurable parameters.
    Exponential {
        /// Initial delay.
        base: Duration,
        /// Maximum delay.
        max: Duration,
        /// Multiplier for each attempt.
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate the delay after a given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed(*defaults::RETRY_DELAY.default_value())
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first. `None` retries until success or a
    /// non-retryable error.
    pub max_attempts: Option<u32>,
    /// Delay between attempts.
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_options(&Options::new())
    }
}

impl RetryConfig {
    /// Read the retry tunables from an option set.
    ///
    /// Exponential backoff replaces the fixed delay when enabled.
    pub fn from_options(options: &Options) -> Self {
        let backoff = if options.get(&defaults::RETRY_BACKOFF_ENABLED) {
            BackoffStrategy::Exponential {
                base: options.get(&defaults::RETRY_BACKOFF_DELAY),
                max: options.get(&defaults::RETRY_BACKOFF_MAX_DELAY),
                multiplier: options.get(&defaults::RETRY_BACKOFF_DELAY_FACTOR),
            }
        } else {
            BackoffStrategy::Fixed(options.get(&defaults::RETRY_DELAY))
        };
        Self {
            max_attempts: options.get(&defaults::RETRY_MAX_ATTEMPTS),
            backoff,
        }
    }

    /// Create a configuration with a fixed delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: BackoffStrategy::Fixed(delay),
        }
    }

    /// Set the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Retry until success or a non-retryable error.
    pub fn unlimited(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if another attempt may follow `attempts` completed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

/// Runs an operation until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    /// Create a retry policy.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op`, retrying errors classified as retryable.
    ///
    /// The last error is returned as-is once attempts are exhausted.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && self.config.should_retry(attempts) => {
                    let delay = self.config.backoff.delay_for_attempt(attempts - 1);
                    trace!(attempt = attempts, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempts > 1 {
                        debug!(attempts, error = %e, "giving up");
                    }
                    return Err(e);
                }
            }
        }
    }
}
