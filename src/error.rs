//! Error types for query operations.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Broad classification of a [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Programmer errors: double release, locked option, duplicate key.
    Lifecycle,
    /// Pool acquisition failures.
    Acquisition,
    /// Socket-level failures and unhealthy connections.
    Transport,
    /// The remote answered something the codec could not assemble.
    Protocol,
    /// Admission control and circuit breaking.
    Resilience,
}

/// Errors that can occur while acquiring connections and dispatching requests.
#[derive(Error, Debug)]
pub enum QueryError {
    /// A managed resource was released more often than it was retained.
    #[error("Resource '{name}' already released")]
    AlreadyReleased { name: String },

    /// Tearing down a managed resource failed.
    #[error("Failed to close resource '{name}': {source}")]
    TeardownFailed {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An option is locked and cannot be modified.
    #[error("Option '{key}' is locked")]
    OptionLocked { key: String },

    /// An option with the same key already exists.
    #[error("Option '{key}' is already defined")]
    DuplicateOption { key: String },

    /// An option definition is invalid.
    #[error("Invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    /// A connection was released to a pool that does not own it.
    #[error("Connection {conn_id} is not checked out from this pool")]
    ForeignConnection { conn_id: u64 },

    /// No connection became available within the acquisition timeout.
    #[error("Timed out acquiring a connection after {0:?}")]
    AcquireTimeout(Duration),

    /// Too many callers are already waiting for a connection.
    #[error("Too many pending acquires for {key} (max {max})")]
    PendingAcquireOverflow { key: String, max: usize },

    /// The backing executor has shut down.
    #[error("Executor is shut down, rejecting new work")]
    Rejected,

    /// The connection pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Establishing a connection failed.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection failed its health check.
    #[error("Connection failed health check")]
    UnhealthyConnection,

    /// No complete response arrived in time.
    #[error("No response received within {0:?}")]
    ResponseTimeout(Duration),

    /// Response reassembly stopped before the response was complete.
    #[error("Incomplete packet: received {received} bytes, expected {expected:?}")]
    IncompletePacket {
        received: usize,
        expected: Option<usize>,
    },

    /// The response could not be decoded.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The circuit breaker is open.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The rate limiter did not admit the request in time.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
}

/// Result type alias for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;

impl QueryError {
    /// Create a new malformed response error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Create a new invalid option error.
    pub fn invalid_option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyReleased { .. }
            | Self::TeardownFailed { .. }
            | Self::OptionLocked { .. }
            | Self::DuplicateOption { .. }
            | Self::InvalidOption { .. }
            | Self::ForeignConnection { .. } => ErrorKind::Lifecycle,
            Self::AcquireTimeout(_)
            | Self::PendingAcquireOverflow { .. }
            | Self::Rejected
            | Self::PoolClosed => ErrorKind::Acquisition,
            Self::Io(_)
            | Self::ConnectFailed { .. }
            | Self::ConnectionClosed
            | Self::UnhealthyConnection
            | Self::ResponseTimeout(_) => ErrorKind::Transport,
            Self::IncompletePacket { .. } | Self::MalformedResponse(_) => ErrorKind::Protocol,
            Self::CircuitOpen | Self::RateLimitExceeded => ErrorKind::Resilience,
        }
    }

    /// Check if a retry policy may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AcquireTimeout(_)
            | Self::PendingAcquireOverflow { .. }
            | Self::IncompletePacket { .. } => true,
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied
            ),
            _ => self.kind() == ErrorKind::Transport,
        }
    }

    /// Check if this error counts as a failure for circuit breaker statistics.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Acquisition | ErrorKind::Transport | ErrorKind::Protocol
        ) && !matches!(self, Self::Rejected | Self::PoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueryError::OptionLocked {
            key: "pool.max_connections".into(),
        };
        assert_eq!(format!("{err}"), "Option 'pool.max_connections' is locked");

        let err = QueryError::IncompletePacket {
            received: 12,
            expected: Some(40),
        };
        assert_eq!(
            format!("{err}"),
            "Incomplete packet: received 12 bytes, expected Some(40)"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        let err: QueryError = io_err.into();
        assert!(matches!(err, QueryError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            QueryError::AlreadyReleased { name: "x".into() }.kind(),
            ErrorKind::Lifecycle
        );
        assert!(QueryError::AcquireTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!QueryError::Rejected.is_retryable());
        assert!(!QueryError::CircuitOpen.is_retryable());
        assert!(!QueryError::malformed("bad header").is_retryable());
        assert!(QueryError::ConnectionClosed.trips_breaker());
        assert!(!QueryError::RateLimitExceeded.trips_breaker());
        assert!(!QueryError::PoolClosed.trips_breaker());
    }
}
