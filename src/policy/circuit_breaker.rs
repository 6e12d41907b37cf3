//! Count-window circuit breaker.
//!
//! The breaker has three states:
//! - Closed: calls pass through and outcomes are recorded in a window
//! - Open: calls fail immediately with [`QueryError::CircuitOpen`]
//! - HalfOpen: a limited number of trial calls decide whether to close

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{QueryError, Result};
use crate::options::{Options, defaults};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Requests fail immediately.
    Open,
    /// Trial requests probe for recovery.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// How long the breaker stays open before allowing trials.
    pub delay: Duration,
    /// Failures within the window that open the breaker.
    pub failure_threshold: u32,
    /// Number of most recent outcomes tracked while closed.
    pub failure_thresholding_capacity: u32,
    /// Consecutive trial successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_options(&Options::new())
    }
}

impl CircuitBreakerConfig {
    /// Read the breaker tunables from an option set.
    pub fn from_options(options: &Options) -> Self {
        Self {
            delay: options.get(&defaults::CIRCUIT_BREAKER_DELAY),
            failure_threshold: options.get(&defaults::CIRCUIT_BREAKER_FAILURE_THRESHOLD),
            failure_thresholding_capacity: options
                .get(&defaults::CIRCUIT_BREAKER_FAILURE_THRESHOLDING_CAPACITY),
            success_threshold: options.get(&defaults::CIRCUIT_BREAKER_SUCCESS_THRESHOLD),
        }
    }

    /// Set the open delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Open after `failures` failures among the last `capacity` outcomes.
    pub fn with_failure_threshold(mut self, failures: u32, capacity: u32) -> Self {
        self.failure_threshold = failures.max(1);
        self.failure_thresholding_capacity = capacity.max(self.failure_threshold);
        self
    }

    /// Set the consecutive trial successes needed to close.
    pub fn with_success_threshold(mut self, successes: u32) -> Self {
        self.success_threshold = successes.max(1);
        self
    }
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { successes: u32, trials: u32 },
}

#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    /// Bumped on every entry into half-open so stale permits are ignored.
    epoch: u64,
    /// Recent outcomes while closed; `true` is a failure.
    window: VecDeque<bool>,
}

impl BreakerState {
    fn failures(&self) -> u32 {
        self.window.iter().filter(|failed| **failed).count() as u32
    }

    fn push_outcome(&mut self, capacity: usize, failed: bool) {
        while self.window.len() >= capacity {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn open(&mut self) {
        self.phase = Phase::Open {
            since: Instant::now(),
        };
        self.window.clear();
    }
}

/// Guards calls to a flaky dependency.
///
/// Clones share state.
///
/// # Example
///
/// ```no_run
/// use gamequery::policy::{CircuitBreaker, CircuitBreakerConfig};
/// use std::time::Duration;
///
/// # async fn run() -> gamequery::Result<()> {
/// let breaker = CircuitBreaker::new(
///     CircuitBreakerConfig::default()
///         .with_failure_threshold(3, 5)
///         .with_delay(Duration::from_secs(1)),
/// );
/// let value = breaker.call(|| async { Ok(42) }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let capacity = config.failure_thresholding_capacity.max(1) as usize;
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState {
                phase: Phase::Closed,
                epoch: 0,
                window: VecDeque::with_capacity(capacity),
            })),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose delay has elapsed reports
    /// half-open.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        match state.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Failures currently in the closed-state window.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failures()
    }

    /// Force the breaker closed and clear its window.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Closed;
        state.window.clear();
    }

    fn refresh(&self, state: &mut BreakerState) {
        if let Phase::Open { since } = state.phase {
            if since.elapsed() >= self.config.delay {
                debug!("circuit breaker half-open");
                state.phase = Phase::HalfOpen {
                    successes: 0,
                    trials: 0,
                };
                state.epoch += 1;
            }
        }
    }

    /// Ask permission for one call.
    ///
    /// The outcome is recorded through the returned permit. A permit dropped
    /// without an outcome, for example because the call was cancelled, hands
    /// its half-open trial back.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        let epoch = state.epoch;
        match &mut state.phase {
            Phase::Closed => {}
            Phase::Open { .. } => return Err(QueryError::CircuitOpen),
            Phase::HalfOpen { successes, trials } => {
                if successes.saturating_add(*trials) >= self.config.success_threshold {
                    return Err(QueryError::CircuitOpen);
                }
                *trials += 1;
            }
        }
        Ok(BreakerPermit {
            breaker: self,
            epoch,
            recorded: false,
        })
    }

    fn record_success(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &mut state.phase {
            Phase::Closed => state.push_outcome(self.capacity(), false),
            Phase::HalfOpen { successes, trials } => {
                *trials = trials.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    debug!("circuit breaker closed");
                    state.phase = Phase::Closed;
                    state.window.clear();
                }
            }
            Phase::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.phase {
            Phase::Closed => {
                state.push_outcome(self.capacity(), true);
                let failures = state.failures();
                if failures >= self.config.failure_threshold {
                    warn!(failures, delay = ?self.config.delay, "circuit breaker opened");
                    state.open();
                }
            }
            Phase::HalfOpen { .. } => {
                warn!("circuit breaker trial failed, reopening");
                state.open();
            }
            Phase::Open { .. } => {}
        }
    }

    fn release_trial(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        if let Phase::HalfOpen { trials, .. } = &mut state.phase {
            *trials = trials.saturating_sub(1);
        }
    }

    /// Run `op` under the breaker.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let outcome = op().await;
        permit.record(&outcome);
        outcome
    }

    fn capacity(&self) -> usize {
        self.config.failure_thresholding_capacity.max(1) as usize
    }
}

/// One permitted call through a [`CircuitBreaker`].
#[must_use = "an unrecorded permit counts as a cancelled call"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    recorded: bool,
}

impl BreakerPermit<'_> {
    /// Record an outcome. Only errors that trip the breaker count as
    /// failures; other errors give the permit back uncounted.
    pub fn record<T>(mut self, outcome: &Result<T>) {
        self.recorded = true;
        match outcome {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.trips_breaker() => self.breaker.record_failure(),
            Err(_) => self.breaker.release_trial(self.epoch),
        }
    }

    /// Record a success.
    pub fn success(self) {
        self.record(&Ok(()));
    }

    /// Record a failure.
    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            trace!(epoch = self.epoch, "breaker permit dropped unrecorded");
            self.breaker.release_trial(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3, 5)
                .with_success_threshold(1)
                .with_delay(Duration::from_secs(1)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err(QueryError::ConnectionClosed) })
            .await
    }

    #[test]
    fn test_config_from_options() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.delay, Duration::from_millis(1000));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.failure_thresholding_capacity, 5);
        assert_eq!(config.success_threshold, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_in_window() {
        let breaker = breaker();
        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_window() {
        let breaker = breaker();
        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        for _ in 0..4 {
            breaker.call(|| async { Ok(()) }).await.unwrap();
        }
        assert_eq!(breaker.failure_count(), 1);
        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(fail(&breaker).await, Err(QueryError::ConnectionClosed)));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trials() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(matches!(breaker.try_acquire(), Err(QueryError::CircuitOpen)));
        trial.record(&Err::<(), _>(QueryError::Rejected));
        breaker.try_acquire().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_returns_permit() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let pending = breaker.call(|| std::future::pending::<Result<()>>());
        let cancelled = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(cancelled.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_ignored_after_reopen() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3, 5)
                .with_success_threshold(2)
                .with_delay(Duration::from_secs(1)),
        );
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        let stale = breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        let first = breaker.try_acquire().unwrap();
        let second = breaker.try_acquire().unwrap();
        drop(stale);
        assert!(matches!(breaker.try_acquire(), Err(QueryError::CircuitOpen)));

        first.success();
        second.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_tripping_errors_ignored() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = breaker
                .call(|| async { Err::<(), _>(QueryError::invalid_option("k", "bad")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
