//! Concurrent acquire/release/timeout interleavings on a fixed pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gamequery::connection::{AcquireTimeoutAction, ConnectionPool, PoolConfig, PoolKey};
use gamequery::resource::{ResourceLease, TaskExecutor};
use gamequery::transport::{Connector, Transport};
use gamequery::{QueryError, Result};

const CAPACITY: usize = 4;

#[derive(Debug)]
struct CountingTransport {
    open: AtomicBool,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, _data: Bytes, _recipient: Option<SocketAddr>) -> Result<()> {
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr)> {
        Err(QueryError::ConnectionClosed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct CountingConnector {
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for CountingConnector {
    type Transport = CountingTransport;

    async fn connect(&self, _key: &PoolKey) -> Result<CountingTransport> {
        tokio::task::yield_now().await;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(CountingTransport {
            open: AtomicBool::new(true),
            live: Arc::clone(&self.live),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_release_balance() {
    let connector = CountingConnector::default();
    let live = Arc::clone(&connector.live);
    let executor = TaskExecutor::current("stress", Duration::from_secs(1)).unwrap();
    let pool = ConnectionPool::builder(connector, ResourceLease::standalone("stress", executor))
        .config(
            PoolConfig::fixed(CAPACITY)
                .with_acquire_timeout(Duration::from_millis(5), AcquireTimeoutAction::Fail),
        )
        .build();
    let key = PoolKey::for_address("127.0.0.1:27015".parse().unwrap());

    let checked_out = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for worker in 0..32u64 {
        let pool = pool.clone();
        let checked_out = Arc::clone(&checked_out);
        let peak = Arc::clone(&peak);
        let timeouts = Arc::clone(&timeouts);
        workers.push(tokio::spawn(async move {
            for round in 0..50u64 {
                let conn = match pool.acquire(key).await {
                    Ok(conn) => conn,
                    Err(QueryError::AcquireTimeout(_)) => {
                        timeouts.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    Err(e) => panic!("unexpected acquire failure: {e}"),
                };
                let now = checked_out.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                checked_out.fetch_sub(1, Ordering::SeqCst);

                match (worker + round) % 7 {
                    0 => conn.discard().unwrap(),
                    1 => drop(conn),
                    2 => {
                        // Cancelled acquire racing a release.
                        let pending = pool.acquire(key);
                        drop(conn);
                        let _ = tokio::time::timeout(Duration::from_micros(50), pending).await;
                    }
                    _ => conn.release().unwrap(),
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = pool.stats(&key);
    assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.pending, 0);
    assert!(stats.total <= CAPACITY);
    assert_eq!(stats.total, stats.idle);
    assert_eq!(live.load(Ordering::SeqCst), stats.idle);
    assert_eq!(stats.created - stats.closed, stats.total as u64);

    assert_eq!(pool.close(), stats.idle);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overflow_never_exceeds_capacity() {
    let connector = CountingConnector::default();
    let live = Arc::clone(&connector.live);
    let executor = TaskExecutor::current("overflow", Duration::from_secs(1)).unwrap();
    let pool = ConnectionPool::builder(connector, ResourceLease::standalone("overflow", executor))
        .config(PoolConfig::fixed(2).with_max_pending_acquires(2))
        .build();
    let key = PoolKey::for_address("127.0.0.1:27016".parse().unwrap());

    let a = pool.acquire(key).await.unwrap();
    let b = pool.acquire(key).await.unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(key).await.map(|c| c.id()) })
        })
        .collect();
    while pool.stats(&key).pending < 2 {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        pool.acquire(key).await,
        Err(QueryError::PendingAcquireOverflow { max: 2, .. })
    ));
    assert_eq!(live.load(Ordering::SeqCst), 2);

    drop(a);
    drop(b);
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    assert_eq!(pool.stats(&key).total, 2);
    assert_eq!(live.load(Ordering::SeqCst), 2);
}
