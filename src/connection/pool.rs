//! Keyed connection pool with fixed and adaptive capacity.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{QueryError, Result};
use crate::options::{ConnectionAttributes, OptionRegistry, Options};
use crate::resource::{CloseError, Closeable, ResourceLease, TaskExecutor};
use crate::transport::{Connector, Transport};

use super::config::{AcquireTimeoutAction, PoolConfig};
use super::health::{HealthChecker, TransportOpen};
use super::key::PoolKey;
use super::state::{ConnectionState, PoolStats};

/// A live connection tracked by a pool.
pub struct Connection<T> {
    id: u64,
    key: PoolKey,
    transport: Arc<T>,
    attributes: Arc<ConnectionAttributes>,
    state: ConnectionState,
    created_at: Instant,
    last_used: Instant,
    uses: u64,
}

impl<T> Connection<T> {
    fn new(id: u64, key: PoolKey, transport: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            key,
            transport: Arc::new(transport),
            attributes: Arc::new(ConnectionAttributes::new()),
            state: ConnectionState::Created,
            created_at: now,
            last_used: now,
            uses: 0,
        }
    }

    /// Pool-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key this connection serves.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn shared_transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Per-connection attributes.
    pub fn attributes(&self) -> &ConnectionAttributes {
        &self.attributes
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last checked out or returned.
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Number of times the connection has been checked out.
    pub fn use_count(&self) -> u64 {
        self.uses
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        if config
            .idle_timeout
            .is_some_and(|timeout| self.last_used.elapsed() > timeout)
        {
            return true;
        }
        config
            .max_lifetime
            .is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn duplicate(&self) -> Self {
        Self {
            id: self.id,
            key: self.key,
            transport: Arc::clone(&self.transport),
            attributes: Arc::clone(&self.attributes),
            state: self.state,
            created_at: self.created_at,
            last_used: self.last_used,
            uses: self.uses,
        }
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("uses", &self.uses)
            .finish()
    }
}

type Delivery<K> = oneshot::Sender<Result<PooledConnection<K>>>;
type Pending<K> = oneshot::Receiver<Result<PooledConnection<K>>>;

struct Waiter<K: Connector> {
    id: u64,
    tx: Delivery<K>,
}

struct KeyState<K: Connector> {
    idle: VecDeque<Connection<K::Transport>>,
    /// Idle, checked out, and connecting.
    total: usize,
    waiters: VecDeque<Waiter<K>>,
    created: u64,
    closed: u64,
}

impl<K: Connector> Default for KeyState<K> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            total: 0,
            waiters: VecDeque::new(),
            created: 0,
            closed: 0,
        }
    }
}

impl<K: Connector> KeyState<K> {
    fn next_waiter(&mut self) -> Option<Waiter<K>> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.tx.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn forget(&mut self, count: usize) {
        self.total = self.total.saturating_sub(count);
        self.closed += count as u64;
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total,
            idle: self.idle.len(),
            in_use: self.total.saturating_sub(self.idle.len()),
            pending: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            created: self.created,
            closed: self.closed,
        }
    }
}

struct PoolState<K: Connector> {
    keys: HashMap<PoolKey, KeyState<K>>,
    checked_out: HashSet<u64>,
    next_waiter_id: u64,
    closed: bool,
}

enum Plan<K: Connector> {
    Ready(PooledConnection<K>),
    Connect,
    Wait { id: u64, rx: Pending<K> },
}

struct PoolInner<K: Connector> {
    name: String,
    connector: K,
    config: PoolConfig,
    executor: ResourceLease<TaskExecutor>,
    health: Box<dyn HealthChecker<K::Transport>>,
    options: Arc<Options>,
    registry: Arc<OptionRegistry>,
    next_conn_id: AtomicU64,
    state: Mutex<PoolState<K>>,
}

/// Gives a reserved slot back unless the connect succeeded.
struct Reservation<K: Connector> {
    pool: Arc<PoolInner<K>>,
    key: PoolKey,
    armed: bool,
}

impl<K: Connector> Drop for Reservation<K> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.slot_freed(self.key);
        }
    }
}

impl<K: Connector> PoolInner<K> {
    fn plan_acquire(
        self: &Arc<Self>,
        key: PoolKey,
        stale: &mut Vec<Connection<K::Transport>>,
    ) -> Result<Plan<K>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(QueryError::PoolClosed);
        }
        if !self.executor.is_accepting() {
            return Err(QueryError::Rejected);
        }

        let ks = state.keys.entry(key).or_default();
        while let Some(mut conn) = ks.idle.pop_front() {
            if conn.is_expired(&self.config) || !self.health.is_healthy(&conn) {
                ks.forget(1);
                conn.transition(ConnectionState::Unhealthy);
                stale.push(conn);
                continue;
            }
            trace!(pool = %self.name, key = %key, conn_id = conn.id, "reusing idle connection");
            return Ok(Plan::Ready(self.check_out(&mut state.checked_out, conn)));
        }

        if self.config.has_capacity(ks.total) {
            ks.total += 1;
            return Ok(Plan::Connect);
        }

        ks.waiters.retain(|w| !w.tx.is_closed());
        if ks.waiters.len() >= self.config.max_pending_acquires {
            return Err(QueryError::PendingAcquireOverflow {
                key: key.to_string(),
                max: self.config.max_pending_acquires,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        ks.waiters.push_back(Waiter { id, tx });
        trace!(pool = %self.name, key = %key, pending = ks.waiters.len(), "acquire queued");
        Ok(Plan::Wait { id, rx })
    }

    fn check_out(
        self: &Arc<Self>,
        checked_out: &mut HashSet<u64>,
        mut conn: Connection<K::Transport>,
    ) -> PooledConnection<K> {
        conn.transition(ConnectionState::Acquired);
        conn.uses += 1;
        conn.last_used = Instant::now();
        checked_out.insert(conn.id);
        PooledConnection {
            conn,
            pool: Arc::clone(self),
            returned: false,
        }
    }

    /// Open a connection for a slot that has already been reserved.
    async fn connect(self: &Arc<Self>, key: PoolKey) -> Result<PooledConnection<K>> {
        let (tx, rx) = oneshot::channel();
        self.spawn_connect(key, tx);
        rx.await.unwrap_or(Err(QueryError::Rejected))
    }

    fn spawn_connect(self: &Arc<Self>, key: PoolKey, tx: Delivery<K>) {
        let reservation = Reservation {
            pool: Arc::clone(self),
            key,
            armed: true,
        };
        let task = async move {
            let mut reservation = reservation;
            let pool = Arc::clone(&reservation.pool);
            match pool.open(key).await {
                Ok(conn) => {
                    reservation.armed = false;
                    pool.deliver(conn, tx);
                }
                Err(e) => {
                    warn!(pool = %pool.name, key = %key, error = %e, "connect failed");
                    drop(reservation);
                    let _ = tx.send(Err(e));
                }
            }
        };
        // A rejected task is dropped here: the reservation frees the slot and
        // the dropped sender fails the caller with `Rejected`.
        if self.executor.spawn(task).is_err() {
            debug!(pool = %self.name, key = %key, "executor rejected connect");
        }
    }

    async fn open(&self, key: PoolKey) -> Result<Connection<K::Transport>> {
        let transport = self.connector.connect(&key).await?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, key, transport);
        self.options.seed_attributes(&self.registry, conn.attributes());
        debug!(pool = %self.name, key = %key, conn_id = id, "connection opened");
        Ok(conn)
    }

    fn deliver(self: &Arc<Self>, mut conn: Connection<K::Transport>, tx: Delivery<K>) {
        let outcome = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let ks = state.keys.entry(conn.key).or_default();
            ks.created += 1;
            if state.closed {
                ks.forget(1);
                conn.transition(ConnectionState::Unhealthy);
                Err(conn)
            } else {
                Ok(self.check_out(&mut state.checked_out, conn))
            }
        };
        match outcome {
            // If the caller gave up, the rejected handle returns itself on drop.
            Ok(pooled) => {
                let _ = tx.send(Ok(pooled));
            }
            Err(conn) => {
                self.dispose(conn);
                let _ = tx.send(Err(QueryError::PoolClosed));
            }
        }
    }

    async fn wait(
        self: &Arc<Self>,
        key: PoolKey,
        id: u64,
        mut rx: Pending<K>,
    ) -> Result<PooledConnection<K>> {
        let Some(limit) = self.config.acquire_timeout else {
            return rx.await.unwrap_or(Err(QueryError::Rejected));
        };
        if let Ok(received) = tokio::time::timeout(limit, &mut rx).await {
            return received.unwrap_or(Err(QueryError::Rejected));
        }

        let still_queued = {
            let mut state = self.state.lock();
            state.keys.get_mut(&key).is_some_and(|ks| {
                let before = ks.waiters.len();
                ks.waiters.retain(|w| w.id != id);
                ks.waiters.len() != before
            })
        };
        if !still_queued {
            // Already served or a connect is in flight for this waiter.
            return rx.await.unwrap_or(Err(QueryError::Rejected));
        }
        drop(rx);

        match self.config.acquire_timeout_action {
            AcquireTimeoutAction::Fail => {
                debug!(pool = %self.name, key = %key, ?limit, "acquire timed out");
                Err(QueryError::AcquireTimeout(limit))
            }
            AcquireTimeoutAction::NewConnection => {
                {
                    let mut state = self.state.lock();
                    if state.closed {
                        return Err(QueryError::PoolClosed);
                    }
                    state.keys.entry(key).or_default().total += 1;
                }
                debug!(pool = %self.name, key = %key, "acquire timed out, opening beyond capacity");
                self.connect(key).await
            }
        }
    }

    fn check_in(self: &Arc<Self>, mut conn: Connection<K::Transport>, evict: bool) -> Result<()> {
        let key = conn.key;
        let mut evicted = None;
        let mut refill = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.checked_out.remove(&conn.id) {
                return Err(QueryError::ForeignConnection { conn_id: conn.id });
            }

            let reusable = !evict
                && !state.closed
                && self.config.enabled
                && !conn.is_expired(&self.config)
                && self.health.is_healthy(&conn);
            let ks = state.keys.entry(key).or_default();

            if reusable {
                conn.transition(ConnectionState::Idle);
                conn.last_used = Instant::now();
                let mut idle = Some(conn);
                while idle.is_some() {
                    let Some(waiter) = ks.next_waiter() else {
                        break;
                    };
                    let Some(next) = idle.take() else {
                        break;
                    };
                    let pooled = self.check_out(&mut state.checked_out, next);
                    if let Err(Ok(bounced)) = waiter.tx.send(Ok(pooled)) {
                        let mut back = bounced.disarm();
                        state.checked_out.remove(&back.id);
                        back.transition(ConnectionState::Idle);
                        idle = Some(back);
                    }
                }
                if let Some(conn) = idle {
                    ks.idle.push_back(conn);
                }
            } else {
                ks.forget(1);
                conn.transition(ConnectionState::Unhealthy);
                evicted = Some(conn);
                if !state.closed {
                    refill = self.reserve_for_waiter(ks);
                }
            }
        }

        if let Some(conn) = evicted {
            self.dispose(conn);
        }
        if let Some(tx) = refill {
            self.spawn_connect(key, tx);
        }
        Ok(())
    }

    fn reserve_for_waiter(&self, ks: &mut KeyState<K>) -> Option<Delivery<K>> {
        if !self.config.has_capacity(ks.total) {
            return None;
        }
        let waiter = ks.next_waiter()?;
        ks.total += 1;
        Some(waiter.tx)
    }

    fn slot_freed(self: &Arc<Self>, key: PoolKey) {
        let refill = {
            let mut state = self.state.lock();
            let Some(ks) = state.keys.get_mut(&key) else {
                return;
            };
            ks.total = ks.total.saturating_sub(1);
            self.reserve_for_waiter(ks)
        };
        if let Some(tx) = refill {
            self.spawn_connect(key, tx);
        }
    }

    fn dispose(&self, mut conn: Connection<K::Transport>) {
        if conn.state != ConnectionState::Unhealthy {
            conn.transition(ConnectionState::Unhealthy);
        }
        conn.transport.close();
        conn.transition(ConnectionState::Closed);
        debug!(pool = %self.name, key = %conn.key, conn_id = conn.id, uses = conn.uses, "connection closed");
    }

    fn close(&self) -> usize {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let mut idle = Vec::new();
            let mut waiters = Vec::new();
            for ks in state.keys.values_mut() {
                ks.forget(ks.idle.len());
                idle.extend(ks.idle.drain(..));
                waiters.extend(ks.waiters.drain(..));
            }
            (idle, waiters)
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(QueryError::PoolClosed));
        }
        let count = idle.len();
        for conn in idle {
            self.dispose(conn);
        }
        debug!(pool = %self.name, closed = count, "connection pool closed");
        count
    }

    fn cleanup(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            for ks in state.keys.values_mut() {
                let before = ks.idle.len();
                let mut kept = VecDeque::with_capacity(before);
                for mut conn in ks.idle.drain(..) {
                    if conn.is_expired(&self.config) || !self.health.is_healthy(&conn) {
                        conn.transition(ConnectionState::Unhealthy);
                        expired.push(conn);
                    } else {
                        kept.push_back(conn);
                    }
                }
                ks.forget(before - kept.len());
                ks.idle = kept;
            }
            expired
        };
        let count = expired.len();
        for conn in expired {
            self.dispose(conn);
        }
        count
    }
}

/// A keyed pool of reusable connections.
///
/// Connections are opened on demand through a [`Connector`], checked out for
/// one exchange, and returned for reuse. Fixed pools cap connections per key
/// and queue extra acquires; adaptive pools never refuse a caller.
pub struct ConnectionPool<K: Connector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: Connector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Start building a pool that opens connections with `connector` and
    /// runs connects on `executor`.
    pub fn builder(connector: K, executor: ResourceLease<TaskExecutor>) -> ConnectionPoolBuilder<K> {
        ConnectionPoolBuilder {
            name: "pool".to_string(),
            connector,
            executor,
            config: None,
            health: None,
            options: None,
            registry: None,
        }
    }

    /// Get the pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the executor connects run on.
    pub fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    /// Get the option set connections are seeded from.
    pub fn options(&self) -> &Arc<Options> {
        &self.inner.options
    }

    /// Check out a connection for `key`.
    ///
    /// Reuses a healthy idle connection, opens a new one when capacity allows,
    /// or queues until one is released. Queued acquires honor the configured
    /// acquire timeout and timeout action.
    pub async fn acquire(&self, key: PoolKey) -> Result<PooledConnection<K>> {
        let mut stale = Vec::new();
        let plan = self.inner.plan_acquire(key, &mut stale);
        for conn in stale {
            self.inner.dispose(conn);
        }
        match plan? {
            Plan::Ready(conn) => Ok(conn),
            Plan::Connect => self.inner.connect(key).await,
            Plan::Wait { id, rx } => self.inner.wait(key, id, rx).await,
        }
    }

    /// Return a connection to this pool.
    ///
    /// Fails with [`QueryError::ForeignConnection`] if `conn` came from a
    /// different pool; the connection still goes back to its own pool.
    pub fn release(&self, conn: PooledConnection<K>) -> Result<()> {
        if !Arc::ptr_eq(&self.inner, &conn.pool) {
            return Err(QueryError::ForeignConnection { conn_id: conn.id() });
        }
        conn.release()
    }

    /// Statistics for one key.
    pub fn stats(&self, key: &PoolKey) -> PoolStats {
        self.inner
            .state
            .lock()
            .keys
            .get(key)
            .map(KeyState::stats)
            .unwrap_or_default()
    }

    /// Statistics summed over all keys.
    pub fn total_stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut total = PoolStats::default();
        for ks in state.keys.values() {
            total.merge(&ks.stats());
        }
        total
    }

    /// Close expired or unhealthy idle connections.
    ///
    /// Returns the number of connections closed.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Close the pool.
    ///
    /// Queued acquires fail with [`QueryError::PoolClosed`], idle connections
    /// are closed now, and checked-out connections are closed on release.
    /// Returns the number of idle connections closed.
    pub fn close(&self) -> usize {
        self.inner.close()
    }

    /// Check if the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl<K: Connector> Closeable for ConnectionPool<K> {
    fn close(&self) -> std::result::Result<(), CloseError> {
        ConnectionPool::close(self);
        Ok(())
    }
}

impl<K: Connector> fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stats", &self.total_stats())
            .finish()
    }
}

/// Builder for [`ConnectionPool`].
pub struct ConnectionPoolBuilder<K: Connector> {
    name: String,
    connector: K,
    executor: ResourceLease<TaskExecutor>,
    config: Option<PoolConfig>,
    health: Option<Box<dyn HealthChecker<K::Transport>>>,
    options: Option<Arc<Options>>,
    registry: Option<Arc<OptionRegistry>>,
}

impl<K: Connector> ConnectionPoolBuilder<K> {
    /// Set the pool name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the configuration. Defaults to the options' pool tunables.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the health checker. Defaults to [`TransportOpen`].
    pub fn health_checker(mut self, checker: impl HealthChecker<K::Transport> + 'static) -> Self {
        self.health = Some(Box::new(checker));
        self
    }

    /// Set the option set used for configuration and attribute seeding.
    pub fn options(mut self, options: Arc<Options>) -> Self {
        self.options = Some(options);
        self
    }

    /// Set the registry whose auto-create options seed new connections.
    pub fn registry(mut self, registry: Arc<OptionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the pool.
    pub fn build(self) -> ConnectionPool<K> {
        let options = self.options.unwrap_or_default();
        let config = self
            .config
            .unwrap_or_else(|| PoolConfig::from_options(&options));
        ConnectionPool {
            inner: Arc::new(PoolInner {
                name: self.name,
                connector: self.connector,
                config,
                executor: self.executor,
                health: self
                    .health
                    .unwrap_or_else(|| Box::new(TransportOpen) as Box<dyn HealthChecker<K::Transport>>),
                options,
                registry: self.registry.unwrap_or_default(),
                next_conn_id: AtomicU64::new(1),
                state: Mutex::new(PoolState {
                    keys: HashMap::new(),
                    checked_out: HashSet::new(),
                    next_waiter_id: 0,
                    closed: false,
                }),
            }),
        }
    }
}

/// A checked-out connection.
///
/// Returns to its pool when dropped. Use [`release`](Self::release) to see
/// the outcome, or [`discard`](Self::discard) to close it instead.
pub struct PooledConnection<K: Connector> {
    conn: Connection<K::Transport>,
    pool: Arc<PoolInner<K>>,
    returned: bool,
}

impl<K: Connector> PooledConnection<K> {
    /// Return the connection to its pool.
    pub fn release(mut self) -> Result<()> {
        self.returned = true;
        self.pool.check_in(self.conn.duplicate(), false)
    }

    /// Close the connection and free its pool slot.
    pub fn discard(mut self) -> Result<()> {
        self.returned = true;
        self.pool.check_in(self.conn.duplicate(), true)
    }

    fn disarm(mut self) -> Connection<K::Transport> {
        self.returned = true;
        self.conn.duplicate()
    }
}

impl<K: Connector> Deref for PooledConnection<K> {
    type Target = Connection<K::Transport>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;
        if let Err(e) = self.pool.check_in(self.conn.duplicate(), false) {
            warn!(pool = %self.pool.name, conn_id = self.conn.id, error = %e, "release on drop failed");
        }
    }
}

impl<K: Connector> fmt::Debug for PooledConnection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("conn", &self.conn)
            .finish()
    }
}
