//! Connection pooling for query clients.
//!
//! This module provides:
//! - A keyed [`ConnectionPool`] with fixed and adaptive capacity
//! - Acquire timeouts with a configurable timeout action
//! - Pluggable health checks run on acquire and release
//! - Pool keys derived from the destination address and message type
//!
//! # Example
//!
//! ```no_run
//! use gamequery::connection::{ConnectionPool, PoolConfig, PoolKey};
//! use gamequery::resource::{ResourceLease, TaskExecutor};
//! use gamequery::transport::{Transport, UdpConnector};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = TaskExecutor::current("pool", Duration::from_secs(5))?;
//!     let pool = ConnectionPool::builder(UdpConnector::new(), ResourceLease::standalone("pool", executor))
//!         .config(PoolConfig::fixed(4).with_idle_timeout(Duration::from_secs(30)))
//!         .build();
//!
//!     let key = PoolKey::for_address("127.0.0.1:27015".parse()?);
//!     let conn = pool.acquire(key).await?;
//!     conn.transport().send(Bytes::from_static(b"\xff\xff\xff\xffTSource Engine Query\0"), None).await?;
//!
//!     // Returned to the pool when dropped
//!     drop(conn);
//!     Ok(())
//! }
//! ```

mod config;
mod health;
mod key;
mod pool;
mod state;

pub use config::{AcquireTimeoutAction, PoolConfig, PoolStrategy};
pub use health::{HealthChecker, MaxUses, TransportOpen};
pub use key::{KeyStrategy, PoolKey};
pub use pool::{Connection, ConnectionPool, ConnectionPoolBuilder, PooledConnection};
pub use state::{ConnectionState, PoolStats};
