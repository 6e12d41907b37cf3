//! Connection pool configuration types.

use std::time::Duration;

use crate::options::{Options, defaults};

/// Capacity strategy of a connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolStrategy {
    /// Bounded connections per key; extra acquires queue.
    Fixed,
    /// Unbounded connections per key; idle connections are reused first.
    #[default]
    Adaptive,
}

/// What a queued acquire does when its timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AcquireTimeoutAction {
    /// Fail with [`AcquireTimeout`](crate::QueryError::AcquireTimeout).
    #[default]
    Fail,
    /// Open a connection beyond the nominal capacity.
    NewConnection,
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Reuse connections. When false, every release closes the connection.
    pub enabled: bool,
    /// Capacity strategy.
    pub strategy: PoolStrategy,
    /// Maximum connections per key for [`PoolStrategy::Fixed`].
    pub max_connections: usize,
    /// Maximum queued acquires per key for [`PoolStrategy::Fixed`].
    pub max_pending_acquires: usize,
    /// How long a queued acquire may wait. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// What to do when `acquire_timeout` elapses.
    pub acquire_timeout_action: AcquireTimeoutAction,
    /// Idle timeout before a connection is closed.
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_options(&Options::new())
    }
}

impl PoolConfig {
    /// Read the pool tunables from an option set.
    pub fn from_options(options: &Options) -> Self {
        Self {
            enabled: options.get(&defaults::POOL_ENABLED),
            strategy: options.get(&defaults::POOL_STRATEGY),
            max_connections: options.get(&defaults::POOL_MAX_CONNECTIONS),
            max_pending_acquires: options.get(&defaults::POOL_MAX_PENDING_ACQUIRES),
            acquire_timeout: options.get(&defaults::POOL_ACQUIRE_TIMEOUT),
            acquire_timeout_action: options.get(&defaults::POOL_ACQUIRE_TIMEOUT_ACTION),
            idle_timeout: options.get(&defaults::POOL_IDLE_TIMEOUT),
            max_lifetime: options.get(&defaults::POOL_MAX_LIFETIME),
        }
    }

    /// Create a fixed pool configuration with `max` connections per key.
    pub fn fixed(max: usize) -> Self {
        Self::default().with_strategy(PoolStrategy::Fixed).with_max_connections(max)
    }

    /// Enable or disable pooling.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the capacity strategy.
    pub fn with_strategy(mut self, strategy: PoolStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the maximum connections per key.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the maximum number of queued acquires per key.
    pub fn with_max_pending_acquires(mut self, max: usize) -> Self {
        self.max_pending_acquires = max;
        self
    }

    /// Set the acquire timeout and the action taken when it elapses.
    pub fn with_acquire_timeout(mut self, timeout: Duration, action: AcquireTimeoutAction) -> Self {
        self.acquire_timeout = Some(timeout);
        self.acquire_timeout_action = action;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Disable the idle timeout.
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Set the maximum lifetime.
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Disable maximum lifetime.
    pub fn without_max_lifetime(mut self) -> Self {
        self.max_lifetime = None;
        self
    }

    /// Check if a new connection may be opened for a key with `total` live
    /// connections.
    pub(crate) fn has_capacity(&self, total: usize) -> bool {
        !self.enabled || self.strategy == PoolStrategy::Adaptive || total < self.max_connections
    }
}
