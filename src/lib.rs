//! Asynchronous transport core for game-server query clients.
//!
//! This crate provides the machinery between a query client and the wire:
//! pooled connections, typed configuration, resilience policies, and
//! request/response correlation over datagram and stream sockets.
//!
//! # Features
//!
//! - Reference-counted shared resources with single teardown
//! - Typed, lockable options that also seed per-connection attributes
//! - Keyed connection pools with fixed or adaptive capacity
//! - Retry, circuit breaker and rate limiter policies
//! - Envelopes whose promises are completed exactly once
//! - Reassembly of responses split across several packets
//!
//! # Example
//!
//! ```no_run
//! use gamequery::QueryContext;
//! use gamequery::codec::FramedCodec;
//! use gamequery::options::defaults;
//! use gamequery::transport::UdpConnector;
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = QueryContext::new();
//!     context.options().add(&defaults::REPORT_INCOMPLETE, true)?;
//!
//!     let messenger = context.messenger(UdpConnector::new(), FramedCodec::new())?;
//!     let addr = gamequery::parse_address("127.0.0.1", 27015).await?;
//!     let reply = messenger.request(Bytes::from_static(b"info"), Some(addr)).await?;
//!
//!     println!("Response: {:?}", reply);
//!     Ok(())
//! }
//! ```
//!
//! # Request Path
//!
//! ```text
//! caller ──► Messenger ──► RateLimiter ──► CircuitBreaker ──► Retry
//!                                                               │
//!            Promise ◄── Codec decoder ◄── Transport ◄── ConnectionPool
//! ```

pub mod address;
pub mod codec;
pub mod connection;
pub mod context;
pub mod error;
pub mod messenger;
pub mod options;
pub mod policy;
pub mod resource;
pub mod transport;

// Re-export commonly used types at the crate root
pub use address::parse_address;
pub use codec::{Codec, Decoded, FramedCodec, ResponseDecoder};
pub use connection::{ConnectionPool, PoolConfig, PoolKey, PoolStrategy, PooledConnection};
pub use context::QueryContext;
pub use error::{ErrorKind, QueryError, Result};
pub use messenger::{Envelope, Messenger, MessengerConfig, Promise, ResponseFuture};
pub use options::{ClientOption, ConnectionAttributes, OptionRegistry, Options};
pub use policy::ResiliencePolicy;
pub use resource::{ManagedResource, ManagedResourceProvider, ResourceLease, TaskExecutor};
