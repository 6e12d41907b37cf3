//! Connection health checks.

use crate::transport::Transport;

use super::pool::Connection;

/// Decides whether a connection may be handed out or kept for reuse.
///
/// Runs under the pool lock on every acquire of an idle connection and on
/// every release, so implementations must not block.
pub trait HealthChecker<T>: Send + Sync {
    /// Check if `connection` is fit for reuse.
    fn is_healthy(&self, connection: &Connection<T>) -> bool;
}

impl<T, F> HealthChecker<T> for F
where
    F: Fn(&Connection<T>) -> bool + Send + Sync,
{
    fn is_healthy(&self, connection: &Connection<T>) -> bool {
        self(connection)
    }
}

/// Healthy while the underlying transport is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportOpen;

impl<T: Transport> HealthChecker<T> for TransportOpen {
    fn is_healthy(&self, connection: &Connection<T>) -> bool {
        connection.transport().is_open()
    }
}

/// Healthy while the transport is open and the connection has served fewer
/// than `max_uses` exchanges.
#[derive(Debug, Clone, Copy)]
pub struct MaxUses {
    /// Exchanges after which the connection is retired.
    pub max_uses: u64,
}

impl<T: Transport> HealthChecker<T> for MaxUses {
    fn is_healthy(&self, connection: &Connection<T>) -> bool {
        connection.transport().is_open() && connection.use_count() < self.max_uses
    }
}
