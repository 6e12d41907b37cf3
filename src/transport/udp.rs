//! Datagram transport.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::trace;

use crate::connection::PoolKey;
use crate::error::{QueryError, Result};
use crate::options::{Options, defaults};

use super::{Connector, Transport, unspecified_for};

/// Default receive buffer size for a single datagram.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1400;

/// A UDP socket, either connected to one peer or free to send anywhere.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    max_datagram_size: usize,
    open: AtomicBool,
    closed: Notify,
}

impl UdpTransport {
    /// Bind an unconnected socket to `local`.
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_socket(socket, None))
    }

    /// Bind an ephemeral socket and connect it to `peer`.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(unspecified_for(Some(peer))).await?;
        socket
            .connect(peer)
            .await
            .map_err(|source| QueryError::ConnectFailed { addr: peer, source })?;
        Ok(Self::from_socket(socket, Some(peer)))
    }

    fn from_socket(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket,
            peer,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            open: AtomicBool::new(true),
            closed: Notify::new(),
        }
    }

    /// Set the maximum datagram size accepted by `recv`.
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size.max(1);
        self
    }

    /// Get the maximum datagram size.
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueryError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: Bytes, recipient: Option<SocketAddr>) -> Result<()> {
        self.ensure_open()?;
        match (self.peer, recipient) {
            (Some(_), _) => {
                self.socket.send(&data).await?;
            }
            (None, Some(addr)) => {
                self.socket.send_to(&data, addr).await?;
            }
            (None, None) => {
                return Err(QueryError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unconnected datagram socket needs a recipient",
                )));
            }
        }
        trace!(len = data.len(), "datagram sent");
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr)> {
        let closed = self.closed.notified();
        self.ensure_open()?;

        // One spare byte tells an oversized datagram from one that fits.
        let mut buf = BytesMut::zeroed(self.max_datagram_size + 1);
        tokio::select! {
            received = self.socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                if len > self.max_datagram_size {
                    return Err(QueryError::malformed(format!(
                        "datagram from {from} exceeds {} bytes",
                        self.max_datagram_size
                    )));
                }
                buf.truncate(len);
                trace!(len, %from, "datagram received");
                Ok((buf.freeze(), from))
            }
            _ = closed => Err(QueryError::ConnectionClosed),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.closed.notify_waiters();
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.socket.local_addr().ok())
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Opens [`UdpTransport`]s.
///
/// Keys with an address get a connected socket. Address-agnostic keys get an
/// unconnected socket that sends to each envelope's recipient.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    connect_timeout: Duration,
    max_datagram_size: usize,
}

impl UdpConnector {
    /// Create a connector with default settings.
    pub fn new() -> Self {
        Self {
            connect_timeout: *defaults::CONNECT_TIMEOUT.default_value(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    /// Build a connector from an option set.
    pub fn from_options(options: &Options) -> Self {
        Self {
            connect_timeout: options.get(&defaults::CONNECT_TIMEOUT),
            max_datagram_size: options.get(&defaults::MAX_DATAGRAM_SIZE),
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum datagram size.
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }
}

impl Default for UdpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for UdpConnector {
    type Transport = UdpTransport;

    async fn connect(&self, key: &PoolKey) -> Result<UdpTransport> {
        let transport = match key.address() {
            Some(peer) => timeout(self.connect_timeout, UdpTransport::connect(peer))
                .await
                .map_err(|_| QueryError::ConnectFailed {
                    addr: peer,
                    source: io::ErrorKind::TimedOut.into(),
                })??,
            None => UdpTransport::bind(unspecified_for(None)).await?,
        };
        Ok(transport.with_max_datagram_size(self.max_datagram_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let connector = UdpConnector::new();
        let transport = connector
            .connect(&PoolKey::for_address(server_addr))
            .await
            .unwrap();
        assert_eq!(transport.peer_addr(), Some(server_addr));

        transport
            .send(Bytes::from_static(b"ping"), None)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, client) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");

        server.send_to(b"pong", client).await.unwrap();
        let (reply, from) = transport.recv().await.unwrap();
        assert_eq!(&reply[..], b"pong");
        assert_eq!(from, server_addr);
    }

    #[tokio::test]
    async fn test_unconnected_requires_recipient() {
        let transport = UdpConnector::new()
            .connect(&PoolKey::for_message_type("a2s"))
            .await
            .unwrap();
        assert!(transport.peer_addr().is_none());
        assert!(transport.send(Bytes::from_static(b"x"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let transport = UdpConnector::new()
            .with_max_datagram_size(8)
            .connect(&PoolKey::for_address(server_addr))
            .await
            .unwrap();
        transport
            .send(Bytes::from_static(b"ping"), None)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (_, client) = server.recv_from(&mut buf).await.unwrap();

        server.send_to(b"exactly8", client).await.unwrap();
        let (fits, _) = transport.recv().await.unwrap();
        assert_eq!(&fits[..], b"exactly8");

        server.send_to(b"nine byte", client).await.unwrap();
        assert!(matches!(
            transport.recv().await,
            Err(QueryError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_receiver() {
        let transport = std::sync::Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let reader = std::sync::Arc::clone(&transport);
        let pending = tokio::spawn(async move { reader.recv().await });

        tokio::task::yield_now().await;
        transport.close();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
        assert!(!transport.is_open());
    }
}
