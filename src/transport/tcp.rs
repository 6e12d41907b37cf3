//! Stream transport.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::trace;

use crate::connection::PoolKey;
use crate::error::{QueryError, Result};
use crate::options::{Options, defaults};

use super::{Connector, Transport};

/// Default number of bytes read per `recv` call.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// A TCP connection split into independently locked halves.
///
/// Each `recv` returns whatever bytes the stream has delivered, so a response
/// may arrive across several calls.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_buffer_size: usize,
    open: AtomicBool,
    closed: Notify,
}

impl TcpTransport {
    /// Connect to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| QueryError::ConnectFailed { addr, source })?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            local_addr,
            peer_addr,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            open: AtomicBool::new(true),
            closed: Notify::new(),
        })
    }

    /// Set the number of bytes read per `recv` call.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
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
impl Transport for TcpTransport {
    async fn send(&self, data: Bytes, _recipient: Option<SocketAddr>) -> Result<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        trace!(len = data.len(), peer = %self.peer_addr, "stream write");
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr)> {
        let closed = self.closed.notified();
        self.ensure_open()?;

        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.read_buffer_size);
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read?,
            _ = closed => return Err(QueryError::ConnectionClosed),
        };
        if read == 0 {
            self.open.store(false, Ordering::Release);
            return Err(QueryError::ConnectionClosed);
        }
        trace!(len = read, peer = %self.peer_addr, "stream read");
        Ok((buf.freeze(), self.peer_addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
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

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Opens [`TcpTransport`]s. Keys must carry an address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    read_buffer_size: usize,
}

impl TcpConnector {
    /// Create a connector with default settings.
    pub fn new() -> Self {
        Self {
            connect_timeout: *defaults::CONNECT_TIMEOUT.default_value(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Build a connector from an option set.
    pub fn from_options(options: &Options) -> Self {
        Self::new().with_connect_timeout(options.get(&defaults::CONNECT_TIMEOUT))
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, key: &PoolKey) -> Result<TcpTransport> {
        let addr = key.address().ok_or_else(|| {
            QueryError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream connections need a destination address",
            ))
        })?;
        let transport = timeout(self.connect_timeout, TcpTransport::connect(addr))
            .await
            .map_err(|_| QueryError::ConnectFailed {
                addr,
                source: io::ErrorKind::TimedOut.into(),
            })??;
        Ok(transport.with_read_buffer_size(self.read_buffer_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
        });

        let transport = TcpConnector::new()
            .connect(&PoolKey::for_address(addr))
            .await
            .unwrap();
        transport
            .send(Bytes::from_static(b"ping"), None)
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            let (chunk, from) = transport.recv().await.unwrap();
            assert_eq!(from, addr);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"pong");

        server.await.unwrap();
        assert!(matches!(
            transport.recv().await,
            Err(QueryError::ConnectionClosed)
        ));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector::new()
            .connect(&PoolKey::for_address(addr))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_requires_address() {
        let err = TcpConnector::new()
            .connect(&PoolKey::for_message_type("rcon"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Io(_)));
    }
}
