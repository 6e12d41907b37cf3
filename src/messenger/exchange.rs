//! The acquire, dispatch, reassemble and release cycle.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace, warn};

use crate::codec::{Codec, Decoded, ResponseDecoder};
use crate::connection::{ConnectionPool, KeyStrategy, PoolKey, PooledConnection};
use crate::error::{QueryError, Result};
use crate::options::{Options, defaults};
use crate::policy::ResiliencePolicy;
use crate::resource::{CloseError, Closeable};
use crate::transport::{Connector, Transport};

use super::envelope::Envelope;
use super::promise::{Promise, ResponseFuture};

/// Message type used for pool keys when none is configured.
pub const DEFAULT_MESSAGE_TYPE: &str = "query";

/// Messenger configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerConfig {
    /// Read timeout used when a connection carries no read timeout attribute.
    ///
    /// Connections are seeded with the pool options' attributes, so this only
    /// applies under a registry without auto-created attributes.
    pub read_timeout: Duration,
    /// Report a response cut short as
    /// [`IncompletePacket`](QueryError::IncompletePacket) when the connection
    /// carries no attribute saying otherwise.
    pub report_incomplete: bool,
    /// How envelopes map to pool keys.
    pub key_strategy: KeyStrategy,
    /// Message type for keys that include one.
    pub message_type: &'static str,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self::from_options(&Options::new())
    }
}

impl MessengerConfig {
    /// Read the messenger tunables from an option set.
    pub fn from_options(options: &Options) -> Self {
        Self {
            read_timeout: options.get(&defaults::READ_TIMEOUT),
            report_incomplete: options.get(&defaults::REPORT_INCOMPLETE),
            key_strategy: KeyStrategy::default(),
            message_type: DEFAULT_MESSAGE_TYPE,
        }
    }

    /// Set the fallback read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the fallback report-incomplete mode.
    pub fn with_report_incomplete(mut self, report: bool) -> Self {
        self.report_incomplete = report;
        self
    }

    /// Set the key strategy.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Set the message type.
    pub fn with_message_type(mut self, message_type: &'static str) -> Self {
        self.message_type = message_type;
        self
    }
}

/// Closes a checked-out connection unless the exchange completed.
struct InFlight<K: Connector> {
    conn: Option<PooledConnection<K>>,
}

impl<K: Connector> InFlight<K> {
    fn release(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.release(),
            None => Ok(()),
        }
    }
}

impl<K: Connector> Drop for InFlight<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let id = conn.id();
            if let Err(e) = conn.discard() {
                warn!(conn_id = id, error = %e, "discarding connection failed");
            }
        }
    }
}

struct MessengerInner<K: Connector, C: Codec> {
    pool: ConnectionPool<K>,
    codec: C,
    policy: ResiliencePolicy,
    config: MessengerConfig,
    shutdown: watch::Sender<bool>,
}

impl<K: Connector, C: Codec> MessengerInner<K, C> {
    fn key_for(&self, recipient: Option<SocketAddr>) -> PoolKey {
        self.config
            .key_strategy
            .key_for(recipient, self.config.message_type)
    }

    async fn dispatch(&self, request: &C::Request, recipient: Option<SocketAddr>) -> Result<C::Response> {
        let key = self.key_for(recipient);
        let payload = self.codec.encode(request)?;
        self.policy
            .execute(move || self.exchange(key, request, payload.clone(), recipient))
            .await
    }

    async fn exchange(
        &self,
        key: PoolKey,
        request: &C::Request,
        payload: Bytes,
        recipient: Option<SocketAddr>,
    ) -> Result<C::Response> {
        let conn = self.pool.acquire(key).await?;
        let read_timeout = conn
            .attributes()
            .get(&defaults::READ_TIMEOUT)
            .unwrap_or(self.config.read_timeout);
        let report_incomplete = conn
            .attributes()
            .get(&defaults::REPORT_INCOMPLETE)
            .unwrap_or(self.config.report_incomplete);
        let transport = Arc::clone(conn.shared_transport());
        let in_flight = InFlight { conn: Some(conn) };

        transport.send(payload, recipient).await?;
        trace!(key = %key, "request sent");

        let mut decoder = self.codec.decoder(request);
        let deadline = Instant::now() + read_timeout;
        loop {
            let received = match timeout_at(deadline, transport.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(if report_incomplete && decoder.buffered() > 0 {
                        decoder.incomplete()
                    } else {
                        QueryError::ResponseTimeout(read_timeout)
                    });
                }
            };
            let (packet, from) = match received {
                Ok(packet) => packet,
                Err(QueryError::ConnectionClosed) if report_incomplete && decoder.buffered() > 0 => {
                    return Err(decoder.incomplete());
                }
                Err(e) => return Err(e),
            };
            if recipient.is_some_and(|addr| addr != from) {
                trace!(key = %key, %from, "ignoring packet from unexpected sender");
                continue;
            }
            match decoder.feed(packet)? {
                Decoded::Complete(response) => {
                    in_flight.release()?;
                    trace!(key = %key, "response complete");
                    return Ok(response);
                }
                Decoded::Partial => {
                    trace!(key = %key, buffered = decoder.buffered(), "partial response");
                }
            }
        }
    }
}

async fn closed(mut shutdown: watch::Receiver<bool>) {
    loop {
        let closed = *shutdown.borrow_and_update();
        if closed {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Performs request/response exchanges over pooled connections.
///
/// Each envelope runs as one task on the pool's executor: the connection is
/// acquired and the request dispatched under the resilience policy, response
/// packets are reassembled by the codec, and the connection goes back to the
/// pool on success or is closed on failure.
///
/// # Example
///
/// ```no_run
/// use gamequery::codec::FramedCodec;
/// use gamequery::connection::ConnectionPool;
/// use gamequery::messenger::Messenger;
/// use gamequery::resource::{ResourceLease, TaskExecutor};
/// use gamequery::transport::UdpConnector;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let executor = TaskExecutor::current("query", Duration::from_secs(5))?;
///     let pool = ConnectionPool::builder(UdpConnector::new(), ResourceLease::standalone("query", executor)).build();
///     let messenger = Messenger::builder(pool, FramedCodec::new()).build()?;
///
///     let reply = messenger
///         .request(Bytes::from_static(b"status"), Some("127.0.0.1:27015".parse()?))
///         .await?;
///     println!("{} bytes", reply.len());
///     Ok(())
/// }
/// ```
pub struct Messenger<K: Connector, C: Codec> {
    inner: Arc<MessengerInner<K, C>>,
}

impl<K: Connector, C: Codec> Clone for Messenger<K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector, C: Codec> Messenger<K, C> {
    /// Start building a messenger over `pool` speaking `codec`.
    pub fn builder(pool: ConnectionPool<K>, codec: C) -> MessengerBuilder<K, C> {
        MessengerBuilder {
            pool,
            codec,
            policy: None,
            config: None,
        }
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.inner.pool
    }

    /// The resilience policy.
    pub fn policy(&self) -> &ResiliencePolicy {
        &self.inner.policy
    }

    /// The configuration.
    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    /// Check if the messenger has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Dispatch an envelope. Its promise is always completed, with the
    /// response or with the failure that ended the exchange.
    pub fn send(&self, envelope: Envelope<C::Request, C::Response>) {
        let (message, sender, recipient, mut promise) = envelope.into_parts();
        if self.is_closed() {
            promise.complete(Err(QueryError::Rejected));
            return;
        }
        if promise.is_abandoned() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        let task = async move {
            trace!(?sender, ?recipient, "dispatching envelope");
            let outcome = tokio::select! {
                outcome = inner.dispatch(&message, recipient) => outcome,
                _ = promise.abandoned() => {
                    debug!(?recipient, "request abandoned");
                    return;
                }
                _ = closed(shutdown) => Err(QueryError::Rejected),
            };
            if let Err(e) = &outcome {
                debug!(?recipient, error = %e, "request failed");
            }
            promise.complete(outcome);
        };
        // A rejected task drops its promise, which fails the response future.
        if let Err(e) = self.inner.pool.executor().spawn(task) {
            debug!(error = %e, "executor rejected envelope");
        }
    }

    /// Send `message` to `recipient` and return the response future.
    pub fn request(&self, message: C::Request, recipient: Option<SocketAddr>) -> ResponseFuture<C::Response> {
        let (promise, response) = Promise::new();
        let mut builder = Envelope::builder(message).promise(promise);
        if let Some(addr) = recipient {
            builder = builder.recipient(addr);
        }
        self.send(builder.build());
        response
    }

    /// Stop accepting envelopes, fail in-flight ones with
    /// [`QueryError::Rejected`], and close the pool.
    pub fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let idle = self.inner.pool.close();
        debug!(idle_closed = idle, "messenger closed");
    }
}

impl<K: Connector, C: Codec> Closeable for Messenger<K, C> {
    fn close(&self) -> std::result::Result<(), CloseError> {
        Messenger::close(self);
        Ok(())
    }
}

impl<K: Connector, C: Codec> fmt::Debug for Messenger<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("pool", &self.inner.pool)
            .field("policy", &self.inner.policy)
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for [`Messenger`].
pub struct MessengerBuilder<K: Connector, C: Codec> {
    pool: ConnectionPool<K>,
    codec: C,
    policy: Option<ResiliencePolicy>,
    config: Option<MessengerConfig>,
}

impl<K: Connector, C: Codec> MessengerBuilder<K, C> {
    /// Set the resilience policy. Defaults to the pool options' policies.
    pub fn policy(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the configuration. Defaults to the pool options' tunables.
    pub fn config(mut self, config: MessengerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the messenger.
    ///
    /// Fails if the pool options describe an invalid resilience policy.
    pub fn build(self) -> Result<Messenger<K, C>> {
        let options = Arc::clone(self.pool.options());
        let policy = match self.policy {
            Some(policy) => policy,
            None => ResiliencePolicy::from_options(&options)?,
        };
        let config = self
            .config
            .unwrap_or_else(|| MessengerConfig::from_options(&options));
        let (shutdown, _) = watch::channel(false);
        Ok(Messenger {
            inner: Arc::new(MessengerInner {
                pool: self.pool,
                codec: self.codec,
                policy,
                config,
                shutdown,
            }),
        })
    }
}
