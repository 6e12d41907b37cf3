//! Connection state and pool statistics.

/// Lifecycle state of a pooled connection.
///
/// `Created -> Idle -> Acquired -> (Idle | Unhealthy -> Closed)`. A fresh
/// connection may go straight from `Created` to `Acquired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Connected but not yet handed out.
    #[default]
    Created,
    /// Waiting in the pool for reuse.
    Idle,
    /// Checked out by a caller.
    Acquired,
    /// Failed a health check and is being evicted.
    Unhealthy,
    /// Closed and removed from the pool.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is checked out.
    pub fn is_acquired(&self) -> bool {
        *self == ConnectionState::Acquired
    }

    /// Check if the connection can be handed out.
    pub fn is_available(&self) -> bool {
        matches!(self, ConnectionState::Created | ConnectionState::Idle)
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }

    /// Check if moving to `next` follows the connection lifecycle.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Created, Idle)
                | (Created, Acquired)
                | (Created, Unhealthy)
                | (Idle, Acquired)
                | (Idle, Unhealthy)
                | (Acquired, Idle)
                | (Acquired, Unhealthy)
                | (Unhealthy, Closed)
        )
    }
}

/// Snapshot of pool accounting for one key or the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Live connections, including ones still connecting.
    pub total: usize,
    /// Connections waiting for reuse.
    pub idle: usize,
    /// Connections checked out or connecting.
    pub in_use: usize,
    /// Acquires queued for a connection.
    pub pending: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed over the pool's lifetime.
    pub closed: u64,
}

impl PoolStats {
    pub(crate) fn merge(&mut self, other: &PoolStats) {
        self.total += other.total;
        self.idle += other.idle;
        self.in_use += other.in_use;
        self.pending += other.pending;
        self.created += other.created;
        self.closed += other.closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Acquired.is_acquired());
        assert!(ConnectionState::Idle.is_available());
        assert!(ConnectionState::Created.is_available());
        assert!(!ConnectionState::Unhealthy.is_available());
        assert!(ConnectionState::Closed.is_closed());
    }

    #[test]
    fn test_transitions() {
        use ConnectionState::*;
        assert!(Created.can_transition_to(Acquired));
        assert!(Acquired.can_transition_to(Idle));
        assert!(Unhealthy.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Closed));
    }

    #[test]
    fn test_stats_merge() {
        let mut total = PoolStats::default();
        total.merge(&PoolStats {
            total: 2,
            idle: 1,
            in_use: 1,
            pending: 0,
            created: 3,
            closed: 1,
        });
        total.merge(&PoolStats {
            total: 1,
            in_use: 1,
            pending: 2,
            created: 1,
            ..Default::default()
        });
        assert_eq!(total.total, 3);
        assert_eq!(total.in_use, 2);
        assert_eq!(total.pending, 2);
        assert_eq!(total.created, 4);
    }
}
