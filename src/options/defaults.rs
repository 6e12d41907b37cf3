//! Built-in option keys and their defaults.

use std::time::Duration;

use crate::connection::{AcquireTimeoutAction, PoolStrategy};
use crate::policy::RateLimitAlgorithm;

use super::option::{ClientOption, OptionEntry};

// Connection pool.

/// Toggle connection pooling. When off, every acquire opens a new connection.
pub static POOL_ENABLED: ClientOption<bool> = ClientOption::builtin("pool.enabled", true);
/// Fixed or adaptive capacity.
pub static POOL_STRATEGY: ClientOption<PoolStrategy> =
    ClientOption::builtin("pool.strategy", PoolStrategy::Adaptive);
/// Maximum connections per key for a fixed pool.
pub static POOL_MAX_CONNECTIONS: ClientOption<usize> =
    ClientOption::builtin("pool.max_connections", 1);
/// Maximum queued acquires per key for a fixed pool.
pub static POOL_MAX_PENDING_ACQUIRES: ClientOption<usize> =
    ClientOption::builtin("pool.max_pending_acquires", usize::MAX);
/// How long a queued acquire may wait. `None` waits forever.
pub static POOL_ACQUIRE_TIMEOUT: ClientOption<Option<Duration>> =
    ClientOption::builtin("pool.acquire_timeout", None);
/// What to do when an acquire times out.
pub static POOL_ACQUIRE_TIMEOUT_ACTION: ClientOption<AcquireTimeoutAction> =
    ClientOption::builtin("pool.acquire_timeout_action", AcquireTimeoutAction::Fail);
/// Idle connections older than this are closed.
pub static POOL_IDLE_TIMEOUT: ClientOption<Option<Duration>> =
    ClientOption::builtin("pool.idle_timeout", Some(Duration::from_secs(60)));
/// Connections older than this are closed on their next release.
pub static POOL_MAX_LIFETIME: ClientOption<Option<Duration>> =
    ClientOption::builtin("pool.max_lifetime", None);

// Transport.

/// Connect timeout, also visible on each connection.
pub static CONNECT_TIMEOUT: ClientOption<Duration> =
    ClientOption::builtin_attribute("transport.connect_timeout", Duration::from_secs(5), false);
/// How long to wait for a complete response.
pub static READ_TIMEOUT: ClientOption<Duration> =
    ClientOption::builtin_attribute("transport.read_timeout", Duration::from_secs(5), true);
/// Report truncated reassembly as [`IncompletePacket`](crate::QueryError::IncompletePacket).
pub static REPORT_INCOMPLETE: ClientOption<bool> =
    ClientOption::builtin_attribute("transport.report_incomplete", false, true);
/// Receive buffer size for datagram transports.
pub static MAX_DATAGRAM_SIZE: ClientOption<usize> =
    ClientOption::builtin("transport.max_datagram_size", 1400);

// Executor.

/// Grace period for in-flight tasks during executor shutdown.
pub static EXECUTOR_SHUTDOWN_GRACE: ClientOption<Duration> =
    ClientOption::builtin("executor.shutdown_grace", Duration::from_secs(5));

// Resilience.

/// Master switch for all resilience policies.
pub static FAILSAFE_ENABLED: ClientOption<bool> = ClientOption::builtin("failsafe.enabled", true);

/// Enable the retry policy.
pub static RETRY_ENABLED: ClientOption<bool> = ClientOption::builtin("retry.enabled", true);
/// Maximum attempts including the first. `None` retries forever.
pub static RETRY_MAX_ATTEMPTS: ClientOption<Option<u32>> =
    ClientOption::builtin("retry.max_attempts", Some(3));
/// Fixed delay between attempts.
pub static RETRY_DELAY: ClientOption<Duration> =
    ClientOption::builtin("retry.delay", Duration::from_millis(1000));
/// Use exponential backoff instead of the fixed delay.
pub static RETRY_BACKOFF_ENABLED: ClientOption<bool> =
    ClientOption::builtin("retry.backoff_enabled", false);
/// First backoff delay.
pub static RETRY_BACKOFF_DELAY: ClientOption<Duration> =
    ClientOption::builtin("retry.backoff_delay", Duration::from_millis(50));
/// Upper bound on the backoff delay.
pub static RETRY_BACKOFF_MAX_DELAY: ClientOption<Duration> =
    ClientOption::builtin("retry.backoff_max_delay", Duration::from_millis(5000));
/// Backoff multiplier applied per attempt.
pub static RETRY_BACKOFF_DELAY_FACTOR: ClientOption<f64> =
    ClientOption::builtin("retry.backoff_delay_factor", 2.0);

/// Enable the circuit breaker.
pub static CIRCUIT_BREAKER_ENABLED: ClientOption<bool> =
    ClientOption::builtin("circuit_breaker.enabled", true);
/// How long the breaker stays open before allowing trial calls.
pub static CIRCUIT_BREAKER_DELAY: ClientOption<Duration> =
    ClientOption::builtin("circuit_breaker.delay", Duration::from_millis(1000));
/// Failures within the window that open the breaker.
pub static CIRCUIT_BREAKER_FAILURE_THRESHOLD: ClientOption<u32> =
    ClientOption::builtin("circuit_breaker.failure_threshold", 3);
/// Number of recent outcomes the failure threshold is measured over.
pub static CIRCUIT_BREAKER_FAILURE_THRESHOLDING_CAPACITY: ClientOption<u32> =
    ClientOption::builtin("circuit_breaker.failure_thresholding_capacity", 5);
/// Consecutive half-open successes that close the breaker.
pub static CIRCUIT_BREAKER_SUCCESS_THRESHOLD: ClientOption<u32> =
    ClientOption::builtin("circuit_breaker.success_threshold", 1);

/// Enable the rate limiter.
pub static RATE_LIMITER_ENABLED: ClientOption<bool> =
    ClientOption::builtin("rate_limiter.enabled", true);
/// Executions permitted per period.
pub static RATE_LIMITER_MAX_EXECUTIONS: ClientOption<u32> =
    ClientOption::builtin("rate_limiter.max_executions", 650);
/// Length of the rate limiting period.
pub static RATE_LIMITER_PERIOD: ClientOption<Duration> =
    ClientOption::builtin("rate_limiter.period", Duration::from_millis(5000));
/// How long a caller may wait for admission. `None` fails immediately.
pub static RATE_LIMITER_MAX_WAIT_TIME: ClientOption<Option<Duration>> =
    ClientOption::builtin("rate_limiter.max_wait_time", Some(Duration::from_secs(10)));
/// Admission algorithm.
pub static RATE_LIMITER_ALGORITHM: ClientOption<RateLimitAlgorithm> =
    ClientOption::builtin("rate_limiter.algorithm", RateLimitAlgorithm::Smooth);

pub(crate) fn builtin_entries() -> Vec<OptionEntry> {
    vec![
        OptionEntry::of(&POOL_ENABLED),
        OptionEntry::of(&POOL_STRATEGY),
        OptionEntry::of(&POOL_MAX_CONNECTIONS),
        OptionEntry::of(&POOL_MAX_PENDING_ACQUIRES),
        OptionEntry::of(&POOL_ACQUIRE_TIMEOUT),
        OptionEntry::of(&POOL_ACQUIRE_TIMEOUT_ACTION),
        OptionEntry::of(&POOL_IDLE_TIMEOUT),
        OptionEntry::of(&POOL_MAX_LIFETIME),
        OptionEntry::of(&CONNECT_TIMEOUT),
        OptionEntry::of(&READ_TIMEOUT),
        OptionEntry::of(&REPORT_INCOMPLETE),
        OptionEntry::of(&MAX_DATAGRAM_SIZE),
        OptionEntry::of(&EXECUTOR_SHUTDOWN_GRACE),
        OptionEntry::of(&FAILSAFE_ENABLED),
        OptionEntry::of(&RETRY_ENABLED),
        OptionEntry::of(&RETRY_MAX_ATTEMPTS),
        OptionEntry::of(&RETRY_DELAY),
        OptionEntry::of(&RETRY_BACKOFF_ENABLED),
        OptionEntry::of(&RETRY_BACKOFF_DELAY),
        OptionEntry::of(&RETRY_BACKOFF_MAX_DELAY),
        OptionEntry::of(&RETRY_BACKOFF_DELAY_FACTOR),
        OptionEntry::of(&CIRCUIT_BREAKER_ENABLED),
        OptionEntry::of(&CIRCUIT_BREAKER_DELAY),
        OptionEntry::of(&CIRCUIT_BREAKER_FAILURE_THRESHOLD),
        OptionEntry::of(&CIRCUIT_BREAKER_FAILURE_THRESHOLDING_CAPACITY),
        OptionEntry::of(&CIRCUIT_BREAKER_SUCCESS_THRESHOLD),
        OptionEntry::of(&RATE_LIMITER_ENABLED),
        OptionEntry::of(&RATE_LIMITER_MAX_EXECUTIONS),
        OptionEntry::of(&RATE_LIMITER_PERIOD),
        OptionEntry::of(&RATE_LIMITER_MAX_WAIT_TIME),
        OptionEntry::of(&RATE_LIMITER_ALGORITHM),
    ]
}
