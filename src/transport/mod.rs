//! Transport layer for query connections.
//!
//! This module provides the [`Transport`] and [`Connector`] seams used by the
//! connection pool, with datagram and stream implementations over tokio
//! sockets.
//!
//! # Example
//!
//! ```no_run
//! use gamequery::connection::PoolKey;
//! use gamequery::transport::{Connector, Transport, UdpConnector};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = UdpConnector::new().with_connect_timeout(Duration::from_secs(2));
//!     let key = PoolKey::for_address("127.0.0.1:27015".parse()?);
//!     let transport = connector.connect(&key).await?;
//!
//!     transport.send(Bytes::from_static(b"\xff\xff\xff\xffTSource Engine Query\0"), None).await?;
//!     let (reply, from) = transport.recv().await?;
//!     println!("{} bytes from {}", reply.len(), from);
//!     Ok(())
//! }
//! ```

mod tcp;
mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::PoolKey;
use crate::error::Result;

pub use tcp::{DEFAULT_READ_BUFFER_SIZE, TcpConnector, TcpTransport};
pub use udp::{DEFAULT_MAX_DATAGRAM_SIZE, UdpConnector, UdpTransport};

/// A connected or connectionless socket owned by one pooled connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one packet.
    ///
    /// `recipient` is required for connectionless transports and ignored by
    /// connected ones.
    async fn send(&self, data: Bytes, recipient: Option<SocketAddr>) -> Result<()>;

    /// Read the next packet and the address it came from.
    ///
    /// Fails with [`ConnectionClosed`](crate::QueryError::ConnectionClosed)
    /// once the transport is closed or the peer hangs up.
    async fn recv(&self) -> Result<(Bytes, SocketAddr)>;

    /// Local socket address.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Remote address, if the transport is connected.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Check if the transport can still carry traffic.
    fn is_open(&self) -> bool;

    /// Mark the transport closed and wake any pending receive.
    fn close(&self);
}

/// Opens transports for pool keys.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The transport type produced.
    type Transport: Transport;

    /// Open a new transport for `key`.
    async fn connect(&self, key: &PoolKey) -> Result<Self::Transport>;
}

fn unspecified_for(addr: Option<SocketAddr>) -> SocketAddr {
    match addr {
        Some(SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
        _ => SocketAddr::from(([0u8; 4], 0)),
    }
}
