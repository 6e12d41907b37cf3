//! Admission control backed by `governor`.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{QueryError, Result};
use crate::options::{Options, defaults};

/// Admission algorithm of a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RateLimitAlgorithm {
    /// Executions are spread evenly over the period.
    #[default]
    Smooth,
    /// The whole period's budget may be spent at once.
    Bursty,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Executions permitted per period.
    pub max_executions: u32,
    /// Length of one period.
    pub period: Duration,
    /// How long a caller may wait for a slot. `None` fails immediately.
    pub max_wait_time: Option<Duration>,
    /// Admission algorithm.
    pub algorithm: RateLimitAlgorithm,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::from_options(&Options::new())
    }
}

impl RateLimiterConfig {
    /// Read the rate limiter tunables from an option set.
    pub fn from_options(options: &Options) -> Self {
        Self {
            max_executions: options.get(&defaults::RATE_LIMITER_MAX_EXECUTIONS),
            period: options.get(&defaults::RATE_LIMITER_PERIOD),
            max_wait_time: options.get(&defaults::RATE_LIMITER_MAX_WAIT_TIME),
            algorithm: options.get(&defaults::RATE_LIMITER_ALGORITHM),
        }
    }

    /// Permit `max_executions` per `period`.
    pub fn with_rate(mut self, max_executions: u32, period: Duration) -> Self {
        self.max_executions = max_executions;
        self.period = period;
        self
    }

    /// Set the maximum wait for a slot. `None` fails immediately.
    pub fn with_max_wait_time(mut self, max_wait_time: Option<Duration>) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    /// Set the admission algorithm.
    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    fn quota(&self) -> Result<Quota> {
        let max = NonZeroU32::new(self.max_executions).ok_or_else(|| {
            QueryError::invalid_option(
                defaults::RATE_LIMITER_MAX_EXECUTIONS.key(),
                "must be greater than zero",
            )
        })?;
        let interval = self.period / max.get();
        let quota = Quota::with_period(interval).ok_or_else(|| {
            QueryError::invalid_option(
                defaults::RATE_LIMITER_PERIOD.key(),
                "too short for the execution count",
            )
        })?;
        Ok(match self.algorithm {
            RateLimitAlgorithm::Smooth => quota,
            RateLimitAlgorithm::Bursty => quota.allow_burst(max),
        })
    }
}

type DirectLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Permits at most a configured number of executions per period.
///
/// Clones share one budget.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimiterConfig>,
    limiter: Arc<DirectLimiter>,
    clock: DefaultClock,
}

impl RateLimiter {
    /// Create a rate limiter.
    ///
    /// Fails with [`QueryError::InvalidOption`] for a zero execution count or
    /// a zero period.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let limiter = Governor::direct(config.quota()?);
        Ok(Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            clock: DefaultClock::default(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Result<()> {
        self.limiter
            .check()
            .map_err(|_| QueryError::RateLimitExceeded)
    }

    /// Take a slot, waiting up to the configured maximum wait.
    ///
    /// Fails immediately when the next slot is further away than the
    /// remaining wait budget.
    pub async fn acquire(&self) -> Result<()> {
        let Some(max_wait) = self.config.max_wait_time else {
            return self.try_acquire();
        };
        let deadline = Instant::now() + max_wait;
        loop {
            let not_until = match self.limiter.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => not_until,
            };
            let wait = not_until.wait_time_from(self.clock.now());
            let remaining = deadline.saturating_duration_since(Instant::now());
            if wait > remaining {
                debug!(?wait, ?remaining, "rate limit exceeded");
                return Err(QueryError::RateLimitExceeded);
            }
            trace!(?wait, "waiting for rate limiter slot");
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_options() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.max_executions, 650);
        assert_eq!(config.period, Duration::from_millis(5000));
        assert_eq!(config.max_wait_time, Some(Duration::from_secs(10)));
        assert_eq!(config.algorithm, RateLimitAlgorithm::Smooth);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let config = RateLimiterConfig::default().with_rate(0, Duration::from_secs(1));
        assert!(matches!(
            RateLimiter::new(config),
            Err(QueryError::InvalidOption { .. })
        ));

        let config = RateLimiterConfig::default().with_rate(10, Duration::ZERO);
        assert!(RateLimiter::new(config).is_err());
    }

    #[test]
    fn test_bursty_spends_budget_at_once() {
        let config = RateLimiterConfig::default()
            .with_rate(3, Duration::from_secs(60))
            .with_algorithm(RateLimitAlgorithm::Bursty);
        let limiter = RateLimiter::new(config).unwrap();
        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }
        assert!(matches!(
            limiter.try_acquire(),
            Err(QueryError::RateLimitExceeded)
        ));
    }

    #[test]
    fn test_smooth_spaces_executions() {
        let config = RateLimiterConfig::default().with_rate(3, Duration::from_secs(60));
        let limiter = RateLimiter::new(config).unwrap();
        limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_waits_for_next_slot() {
        let config = RateLimiterConfig::default()
            .with_rate(1, Duration::from_millis(50))
            .with_max_wait_time(Some(Duration::from_millis(500)));
        let limiter = RateLimiter::new(config).unwrap();

        let start = std::time::Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_fails_when_wait_exceeds_budget() {
        let config = RateLimiterConfig::default()
            .with_rate(1, Duration::from_secs(60))
            .with_max_wait_time(Some(Duration::from_millis(20)));
        let limiter = RateLimiter::new(config).unwrap();

        limiter.acquire().await.unwrap();
        let start = std::time::Instant::now();
        assert!(matches!(
            limiter.acquire().await,
            Err(QueryError::RateLimitExceeded)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_no_wait_fails_immediately() {
        let config = RateLimiterConfig::default()
            .with_rate(1, Duration::from_secs(60))
            .with_max_wait_time(None);
        let limiter = RateLimiter::new(config).unwrap();
        limiter.acquire().await.unwrap();
        assert!(limiter.acquire().await.is_err());
    }
}
