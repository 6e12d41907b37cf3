//! The owner of shared client state.
//!
//! A [`QueryContext`] holds the option registry, the default option set, and
//! the shared executor. Pools and messengers built from one context share
//! one executor unless the caller hands them another.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::codec::Codec;
use crate::connection::ConnectionPool;
use crate::error::Result;
use crate::messenger::Messenger;
use crate::options::{OptionRegistry, Options, defaults};
use crate::resource::{ManagedResourceProvider, ResourceLease, TaskExecutor};
use crate::transport::{Connector, TcpConnector, UdpConnector};

/// Name of the shared executor.
pub const DEFAULT_EXECUTOR: &str = "gamequery-default";

/// Worker threads of an executor that owns its runtime.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Shared registry, options and executor for a family of clients.
///
/// # Example
///
/// ```no_run
/// use gamequery::QueryContext;
/// use gamequery::codec::FramedCodec;
/// use gamequery::options::defaults;
/// use gamequery::transport::UdpConnector;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let context = QueryContext::new();
///     context.options().add(&defaults::READ_TIMEOUT, Duration::from_secs(2))?;
///
///     let messenger = context.messenger(UdpConnector::new(), FramedCodec::new())?;
///     let reply = messenger
///         .request(Bytes::from_static(b"info"), Some("127.0.0.1:27015".parse()?))
///         .await?;
///     println!("{} bytes", reply.len());
///     Ok(())
/// }
/// ```
pub struct QueryContext {
    registry: Arc<OptionRegistry>,
    options: Arc<Options>,
    executors: ManagedResourceProvider<TaskExecutor>,
    worker_threads: usize,
}

impl QueryContext {
    /// Create a context with the built-in options and an empty option set.
    pub fn new() -> Self {
        Self::with_options(Options::new())
    }

    /// Create a context around an existing option set.
    pub fn with_options(options: Options) -> Self {
        Self {
            registry: Arc::new(OptionRegistry::new()),
            options: Arc::new(options),
            executors: ManagedResourceProvider::new(),
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }

    /// Set the worker threads used when the shared executor has to own its
    /// runtime.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// The option registry.
    pub fn registry(&self) -> &Arc<OptionRegistry> {
        &self.registry
    }

    /// The default option set.
    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    /// Lease the shared executor, creating it on first use.
    ///
    /// Inside a tokio runtime the executor spawns onto that runtime;
    /// elsewhere it owns a dedicated one. The executor shuts down once the
    /// last lease is dropped, and the next call creates a fresh one.
    pub fn executor(&self) -> Result<ResourceLease<TaskExecutor>> {
        let grace = self.options.get(&defaults::EXECUTOR_SHUTDOWN_GRACE);
        let threads = self.worker_threads;
        self.executors.lease(DEFAULT_EXECUTOR, || match Handle::try_current() {
            Ok(handle) => Ok(TaskExecutor::from_handle(DEFAULT_EXECUTOR, handle, grace)),
            Err(_) => TaskExecutor::owned(DEFAULT_EXECUTOR, threads, grace),
        })
    }

    /// Check if the shared executor is currently live.
    pub fn has_executor(&self) -> bool {
        self.executors.contains(DEFAULT_EXECUTOR)
    }

    /// Build a pool on the shared executor.
    pub fn pool<K: Connector>(&self, connector: K) -> Result<ConnectionPool<K>> {
        Ok(self.pool_with_executor(connector, self.executor()?))
    }

    /// Build a pool on a caller-supplied executor.
    pub fn pool_with_executor<K: Connector>(
        &self,
        connector: K,
        executor: ResourceLease<TaskExecutor>,
    ) -> ConnectionPool<K> {
        ConnectionPool::builder(connector, executor)
            .options(Arc::clone(&self.options))
            .registry(Arc::clone(&self.registry))
            .build()
    }

    /// Build a messenger with its own pool on the shared executor.
    ///
    /// `connector` is used as given: the context's transport options reach
    /// it only if the caller built it with `from_options`. See
    /// [`udp_messenger`](Self::udp_messenger) and
    /// [`tcp_messenger`](Self::tcp_messenger).
    pub fn messenger<K: Connector, C: Codec>(&self, connector: K, codec: C) -> Result<Messenger<K, C>> {
        Messenger::builder(self.pool(connector)?, codec).build()
    }

    /// Build a datagram messenger whose connector follows the context's
    /// connect timeout and datagram size options.
    pub fn udp_messenger<C: Codec>(&self, codec: C) -> Result<Messenger<UdpConnector, C>> {
        self.messenger(UdpConnector::from_options(&self.options), codec)
    }

    /// Build a stream messenger whose connector follows the context's
    /// connect timeout option.
    pub fn tcp_messenger<C: Codec>(&self, codec: C) -> Result<Messenger<TcpConnector, C>> {
        self.messenger(TcpConnector::from_options(&self.options), codec)
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("options", &self.options.len())
            .field("executors", &self.executors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FramedCodec;
    use crate::error::QueryError;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_pools_share_executor() {
        let context = QueryContext::new();
        let a = context.pool(UdpConnector::new()).unwrap();
        let b = context.pool(UdpConnector::new()).unwrap();
        assert!(context.has_executor());
        assert_eq!(context.executors.names(), vec![DEFAULT_EXECUTOR.to_string()]);
        assert_eq!(a.executor().name(), DEFAULT_EXECUTOR);

        a.executor().shutdown().await;
        assert!(!b.executor().is_accepting());
    }

    #[test]
    fn test_executor_closes_with_last_lease() {
        let context = QueryContext::new();
        let lease = context.executor().unwrap();
        let executor = (*lease).clone();
        assert!(executor.is_accepting());

        drop(lease);
        assert!(!executor.is_accepting());
        assert!(!context.has_executor());

        let fresh = context.executor().unwrap();
        assert!(fresh.is_accepting());
    }

    #[tokio::test]
    async fn test_supplied_executor_not_shared() {
        let context = QueryContext::new();
        let own = TaskExecutor::current("own", Duration::from_secs(1)).unwrap();
        let pool = context.pool_with_executor(UdpConnector::new(), ResourceLease::standalone("own", own));
        assert_eq!(pool.executor().name(), "own");
        assert!(!context.has_executor());
    }

    #[tokio::test]
    async fn test_messenger_uses_context_options() {
        let context = QueryContext::new();
        context
            .options()
            .add(&defaults::RETRY_ENABLED, false)
            .unwrap();
        let messenger = context
            .messenger(UdpConnector::new(), FramedCodec::new())
            .unwrap();
        assert!(messenger.policy().retry().is_none());
        assert!(messenger.policy().circuit_breaker().is_some());
        assert!(Arc::ptr_eq(messenger.pool().options(), context.options()));
    }

    #[tokio::test]
    async fn test_udp_messenger_follows_transport_options() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = FramedCodec::frame(&buf[4..len]).to_vec();
            reply.extend_from_slice(&[0u8; 32]);
            server.send_to(&reply, from).await.unwrap();
        });

        let context = QueryContext::new();
        let options = context.options();
        options.add(&defaults::MAX_DATAGRAM_SIZE, 16).unwrap();
        options.add(&defaults::RETRY_ENABLED, false).unwrap();
        let messenger = context.udp_messenger(FramedCodec::new()).unwrap();

        let err = messenger
            .request(Bytes::from_static(b"info"), Some(addr))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::MalformedResponse(_)));
    }
}
