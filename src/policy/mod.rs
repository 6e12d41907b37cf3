//! Resilience policies around pool acquisition and request dispatch.
//!
//! This module provides:
//! - [`Retry`] with fixed or exponential backoff
//! - [`CircuitBreaker`] over a count-based outcome window
//! - [`RateLimiter`] with smooth or bursty admission
//! - [`ResiliencePolicy`], which composes the enabled policies
//!
//! A call passes the rate limiter first, then the circuit breaker, then the
//! retry loop, and only then reaches the wrapped operation.
//!
//! # Example
//!
//! ```no_run
//! use gamequery::options::{Options, defaults};
//! use gamequery::policy::ResiliencePolicy;
//!
//! # async fn run() -> gamequery::Result<()> {
//! let options = Options::new();
//! options.add(&defaults::RATE_LIMITER_ENABLED, false)?;
//!
//! let policy = ResiliencePolicy::from_options(&options)?;
//! let answer = policy.execute(|| async { Ok(42) }).await?;
//! # Ok(())
//! # }
//! ```

mod circuit_breaker;
mod rate_limiter;
mod retry;

use std::future::Future;

use crate::error::Result;
use crate::options::{Options, defaults};

pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimitAlgorithm, RateLimiter, RateLimiterConfig};
pub use retry::{BackoffStrategy, Retry, RetryConfig};

/// The enabled resilience policies, applied in a fixed order.
///
/// Clones share breaker and limiter state.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePolicy {
    rate_limiter: Option<RateLimiter>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<Retry>,
}

impl ResiliencePolicy {
    /// A policy that runs operations unguarded.
    pub fn none() -> Self {
        Self::default()
    }

    /// Build the policies enabled in `options`.
    ///
    /// Disabling `failsafe.enabled` turns every policy off.
    pub fn from_options(options: &Options) -> Result<Self> {
        if !options.get(&defaults::FAILSAFE_ENABLED) {
            return Ok(Self::none());
        }
        let rate_limiter = if options.get(&defaults::RATE_LIMITER_ENABLED) {
            Some(RateLimiter::new(RateLimiterConfig::from_options(options))?)
        } else {
            None
        };
        let circuit_breaker = options
            .get(&defaults::CIRCUIT_BREAKER_ENABLED)
            .then(|| CircuitBreaker::new(CircuitBreakerConfig::from_options(options)));
        let retry = options
            .get(&defaults::RETRY_ENABLED)
            .then(|| Retry::new(RetryConfig::from_options(options)));
        Ok(Self {
            rate_limiter,
            circuit_breaker,
            retry,
        })
    }

    /// Use `limiter` for admission control.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Guard calls with `breaker`.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Retry calls with `retry`.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The rate limiter, if enabled.
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// The circuit breaker, if enabled.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// The retry policy, if enabled.
    pub fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    /// Run `op` through the enabled policies.
    ///
    /// Errors reach the caller as the operation produced them.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await?;
        }
        let permit = match &self.circuit_breaker {
            Some(breaker) => Some(breaker.try_acquire()?),
            None => None,
        };
        let outcome = match &self.retry {
            Some(retry) => retry.run(op).await,
            None => op().await,
        };
        if let Some(permit) = permit {
            permit.record(&outcome);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_defaults_enable_everything() {
        let policy = ResiliencePolicy::from_options(&Options::new()).unwrap();
        assert!(policy.rate_limiter().is_some());
        assert!(policy.circuit_breaker().is_some());
        assert!(policy.retry().is_some());
    }

    #[test]
    fn test_failsafe_switch_disables_all() {
        let options = Options::new();
        options.add(&defaults::FAILSAFE_ENABLED, false).unwrap();
        let policy = ResiliencePolicy::from_options(&options).unwrap();
        assert!(policy.rate_limiter().is_none());
        assert!(policy.circuit_breaker().is_none());
        assert!(policy.retry().is_none());
    }

    #[test]
    fn test_invalid_rate_surfaces() {
        let options = Options::new();
        options.add(&defaults::RATE_LIMITER_MAX_EXECUTIONS, 0).unwrap();
        assert!(matches!(
            ResiliencePolicy::from_options(&options),
            Err(QueryError::InvalidOption { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_inside_breaker() {
        let policy = ResiliencePolicy::none()
            .with_circuit_breaker(CircuitBreaker::new(
                CircuitBreakerConfig::default().with_failure_threshold(1, 1),
            ))
            .with_retry(Retry::new(RetryConfig::fixed(3, Duration::from_millis(10))));
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueryError::ConnectionClosed)
                } else {
                    Ok("pong")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "pong");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let breaker = policy.circuit_breaker().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_retries() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default().with_failure_threshold(1, 1),
        );
        let policy = ResiliencePolicy::none()
            .with_circuit_breaker(breaker.clone())
            .with_retry(Retry::new(RetryConfig::fixed(3, Duration::from_millis(10))));
        let calls = AtomicU32::new(0);

        let first = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(QueryError::ConnectionClosed)
            })
            .await;
        assert!(matches!(first, Err(QueryError::ConnectionClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        let second = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(QueryError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limiter_gates_breaker() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::default()
                .with_rate(1, Duration::from_secs(60))
                .with_max_wait_time(None),
        )
        .unwrap();
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default().with_failure_threshold(1, 1),
        );
        let policy = ResiliencePolicy::none()
            .with_rate_limiter(limiter)
            .with_circuit_breaker(breaker.clone());

        policy.execute(|| async { Ok(()) }).await.unwrap();
        let err = policy
            .execute(|| async { Err::<(), _>(QueryError::ConnectionClosed) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RateLimitExceeded));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_execution_frees_half_open_trial() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1, 1)
                .with_success_threshold(1)
                .with_delay(Duration::from_secs(1)),
        );
        let policy = ResiliencePolicy::none().with_circuit_breaker(breaker.clone());
        let _ = policy
            .execute(|| async { Err::<(), _>(QueryError::ConnectionClosed) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        let pending = policy.execute(|| std::future::pending::<Result<()>>());
        assert!(tokio::time::timeout(Duration::from_millis(10), pending).await.is_err());

        tokio::time::advance(Duration::from_secs(3600)).await;
        policy.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
