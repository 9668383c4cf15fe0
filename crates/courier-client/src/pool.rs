//! Broker Connection Pool
//!
//! Producers and consumers borrow broker connections from a [`ConnectionPool`]
//! instead of opening their own. Connections are created lazily, handed out as
//! [`PooledConnection`] guards, and recycled when the guard is returned or
//! dropped.
//!
//! ## Design
//!
//! ```text
//!            get()                         put(conn) / drop(conn)
//!   ┌──────────────────────┐           ┌──────────────────────────┐
//!   │ idle set (LIFO)      │ ◄──────── │ alive, pool open, room?  │──no──► close
//!   │ alive && fresh? ─────┼──► reuse  └──────────────────────────┘
//!   │ otherwise create     │
//!   │ (live < max_conns)   │
//!   └──────────────────────┘
//!              ▲
//!              │ every reap_interval
//!   ┌──────────┴───────────┐
//!   │ reaper: close stale  │  last_used older than max_idle_time
//!   │ trim to idle_target  │  oldest first
//!   └──────────────────────┘
//! ```
//!
//! - At most `max_conns` connections are live (idle + in use). A `get` beyond
//!   that waits up to `acquire_timeout` for one to come back.
//! - Dead connections (failed liveness check) are closed on checkout and on return.
//! - After [`ConnectionPool::close`], `get` and `put` fail with `PoolClosed`.
//!
//! ## Thread Safety
//!
//! ConnectionPool is Send + Sync and is shared via `Arc<ConnectionPool>`. The
//! idle set is guarded by a single mutex that is never held across an await.
//!
//! ## Examples
//!
//! ```ignore
//! let pool = ConnectionPool::new(transport, brokers, PoolConfig::default());
//!
//! let conn = pool.get().await?;
//! conn.write_batch("orders", &batch).await?;
//! pool.put(conn).await?; // or just drop it
//! ```

use crate::error::{ClientError, Result};
use courier_core::{BrokerConnection, BrokerTransport};
use courier_observability::{MetricsRecorder, NoopRecorder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections, idle and in use together (default: 10)
    pub max_conns: usize,

    /// Idle connections the reaper keeps around (default: 3)
    pub idle_target: usize,

    /// Maximum idle connections accepted back by `put` (default: `max_conns`)
    pub max_idle: usize,

    /// Idle connections older than this are closed (default: 30 minutes)
    pub max_idle_time: Duration,

    /// How long `get` waits when every connection is in use (default: 5s)
    pub acquire_timeout: Duration,

    /// Reaper period (default: `max_idle_time / 2`)
    pub reap_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 10,
            idle_target: 3,
            max_idle: 10,
            max_idle_time: Duration::from_secs(30 * 60),
            acquire_timeout: Duration::from_secs(5),
            reap_interval: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_conns == 0 {
            return Err(ClientError::Config("max_conns must be at least 1".into()));
        }
        if self.max_idle_time.is_zero() {
            return Err(ClientError::Config("max_idle_time must be positive".into()));
        }
        Ok(())
    }

    fn reap_every(&self) -> Duration {
        self.reap_interval
            .unwrap_or(self.max_idle_time / 2)
            .max(Duration::from_millis(1))
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Idle plus in-use connections
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections opened over the pool's lifetime
    pub created: usize,
    /// Connections closed over the pool's lifetime
    pub closed: usize,
    pub max_conns: usize,
}

struct IdleEntry {
    conn: Box<dyn BrokerConnection>,
    last_used: Instant,
}

struct PoolInner {
    transport: Arc<dyn BrokerTransport>,
    addresses: Vec<String>,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleEntry>>,
    available: Notify,
    closed: AtomicBool,
    live: AtomicUsize,
    created: AtomicUsize,
    retired: AtomicUsize,
    metrics: Arc<dyn MetricsRecorder>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve a slot for a new connection if under `max_conns`.
    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_conns).then_some(live + 1)
            })
            .is_ok()
    }

    fn report_size(&self) {
        let idle = lock(&self.idle).len();
        self.metrics
            .record_pool_size(self.live.load(Ordering::Acquire), idle);
    }

    /// Pop the freshest usable idle connection; stale ones are returned for closing.
    fn take_idle(&self) -> (Option<Box<dyn BrokerConnection>>, Vec<Box<dyn BrokerConnection>>) {
        let mut idle = lock(&self.idle);
        let mut stale = Vec::new();
        while let Some(entry) = idle.pop_back() {
            if entry.conn.is_alive() && entry.last_used.elapsed() <= self.config.max_idle_time {
                return (Some(entry.conn), stale);
            }
            stale.push(entry.conn);
        }
        (None, stale)
    }

    /// Try to park `conn` in the idle set. Gives it back when it must be closed.
    fn park(&self, conn: Box<dyn BrokerConnection>) -> Option<Box<dyn BrokerConnection>> {
        if !conn.is_alive() {
            return Some(conn);
        }
        // `close` flips the flag under this lock before draining the idle set
        let mut idle = lock(&self.idle);
        if self.is_closed() || idle.len() >= self.config.max_idle {
            return Some(conn);
        }
        idle.push_back(IdleEntry {
            conn,
            last_used: Instant::now(),
        });
        drop(idle);
        self.available.notify_waiters();
        None
    }

    fn forget(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.retired.fetch_add(1, Ordering::AcqRel);
        self.available.notify_waiters();
    }

    async fn retire(&self, conn: Box<dyn BrokerConnection>) {
        let id = conn.id();
        if let Err(e) = conn.close().await {
            debug!(connection_id = id, error = %e, "Error while closing connection");
        }
        self.forget();
        trace!(connection_id = id, "Connection retired");
    }

    /// Close `conn` without awaiting; used from `Drop`.
    fn retire_detached(self: &Arc<Self>, conn: Box<dyn BrokerConnection>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move { inner.retire(conn).await });
            }
            Err(_) => {
                warn!(
                    connection_id = conn.id(),
                    "No runtime available, dropping connection without close"
                );
                self.forget();
            }
        }
    }

    /// One reaper pass. Returns the number of connections closed.
    async fn reap(&self) -> usize {
        let doomed: Vec<_> = {
            let mut idle = lock(&self.idle);
            let max_idle_time = self.config.max_idle_time;
            let mut doomed = Vec::new();
            let mut keep = VecDeque::with_capacity(idle.len());
            for entry in idle.drain(..) {
                if entry.conn.is_alive() && entry.last_used.elapsed() <= max_idle_time {
                    keep.push_back(entry);
                } else {
                    doomed.push(entry.conn);
                }
            }
            while keep.len() > self.config.idle_target {
                if let Some(oldest) = keep.pop_front() {
                    doomed.push(oldest.conn);
                }
            }
            *idle = keep;
            doomed
        };

        let count = doomed.len();
        for conn in doomed {
            self.retire(conn).await;
        }
        if count > 0 {
            debug!(closed = count, "Reaper closed idle connections");
            self.report_size();
        }
        count
    }
}

/// Bounded pool of broker connections.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool and start its reaper (when called inside a Tokio runtime).
    ///
    /// # Arguments
    ///
    /// * `transport` - Factory for new connections
    /// * `addresses` - Broker addresses passed to every `connect`
    /// * `config` - Pool limits
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        addresses: Vec<String>,
        config: PoolConfig,
    ) -> Self {
        Self::with_metrics(transport, addresses, config, Arc::new(NoopRecorder))
    }

    pub fn with_metrics(
        transport: Arc<dyn BrokerTransport>,
        addresses: Vec<String>,
        config: PoolConfig,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            transport,
            addresses,
            config,
            idle: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            metrics,
        });
        let shutdown = CancellationToken::new();
        let reaper = Self::spawn_reaper(Arc::downgrade(&inner), shutdown.clone());

        Self {
            inner,
            shutdown,
            reaper: Mutex::new(reaper),
        }
    }

    fn spawn_reaper(inner: Weak<PoolInner>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = inner.upgrade()?.config.reap_every();
        let handle = tokio::runtime::Handle::try_current().ok()?;

        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.reap().await;
                    }
                }
            }
            trace!("Pool reaper stopped");
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn addresses(&self) -> &[String] {
        &self.inner.addresses
    }

    /// Open connections until `idle_target` are idle.
    pub async fn warm_up(&self) -> Result<usize> {
        let config = &self.inner.config;
        let target = config.idle_target.min(config.max_idle).min(config.max_conns);
        let mut opened = 0;
        while lock(&self.inner.idle).len() < target {
            let conn = self.get_new().await?;
            drop(conn);
            opened += 1;
        }
        Ok(opened)
    }

    /// Borrow a connection.
    ///
    /// Reuses the most recently returned idle connection that is alive and not
    /// past `max_idle_time`; otherwise opens a new one.
    ///
    /// # Errors
    ///
    /// - `PoolClosed` after [`close`](Self::close)
    /// - `ConnectFailure` if a new connection could not be opened
    /// - `PoolExhausted` if `max_conns` are in use for longer than `acquire_timeout`
    pub async fn get(&self) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;

        loop {
            if self.inner.is_closed() {
                return Err(ClientError::PoolClosed);
            }

            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (found, stale) = self.inner.take_idle();
            for conn in stale {
                self.inner.retire(conn).await;
            }
            if let Some(conn) = found {
                trace!(connection_id = conn.id(), "Reusing pooled connection");
                return Ok(self.wrap(conn));
            }

            if self.inner.try_reserve() {
                return self.open_reserved().await;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    max_conns = self.inner.config.max_conns,
                    "Connection pool exhausted"
                );
                return Err(ClientError::PoolExhausted(self.inner.config.max_conns));
            }
        }
    }

    /// Borrow a brand-new connection, bypassing the idle set.
    async fn get_new(&self) -> Result<PooledConnection> {
        if self.inner.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        if !self.inner.try_reserve() {
            return Err(ClientError::PoolExhausted(self.inner.config.max_conns));
        }
        self.open_reserved().await
    }

    async fn open_reserved(&self) -> Result<PooledConnection> {
        match self.inner.transport.connect(&self.inner.addresses).await {
            Ok(conn) => {
                self.inner.created.fetch_add(1, Ordering::AcqRel);
                debug!(connection_id = conn.id(), "Opened new broker connection");
                self.inner.report_size();
                Ok(self.wrap(conn))
            }
            Err(e) => {
                self.inner.live.fetch_sub(1, Ordering::AcqRel);
                self.inner.available.notify_waiters();
                self.inner.metrics.record_connection_error();
                warn!(error = %e, "Failed to open broker connection");
                Err(e.into())
            }
        }
    }

    fn wrap(&self, conn: Box<dyn BrokerConnection>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }

    /// Return a connection.
    ///
    /// The connection goes back to the idle set unless it is dead or the idle
    /// set is full, in which case it is closed.
    ///
    /// # Errors
    ///
    /// `PoolClosed` if the pool was closed; the connection is closed anyway.
    pub async fn put(&self, mut conn: PooledConnection) -> Result<()> {
        let Some(raw) = conn.conn.take() else {
            return Ok(());
        };
        let outcome = match self.inner.park(raw) {
            None => Ok(()),
            Some(raw) => {
                let closed = self.inner.is_closed();
                self.inner.retire(raw).await;
                if closed {
                    Err(ClientError::PoolClosed)
                } else {
                    Ok(())
                }
            }
        };
        self.inner.report_size();
        outcome
    }

    /// Close a connection and forget it (e.g. after a connection error).
    pub async fn discard(&self, mut conn: PooledConnection) {
        if let Some(raw) = conn.conn.take() {
            debug!(connection_id = raw.id(), "Discarding connection");
            self.inner.retire(raw).await;
            self.inner.report_size();
        }
    }

    /// Run one reaper pass now. Returns how many connections were closed.
    pub async fn reap(&self) -> usize {
        self.inner.reap().await
    }

    pub fn stats(&self) -> PoolStats {
        let idle = lock(&self.inner.idle).len();
        let live = self.inner.live.load(Ordering::Acquire);
        PoolStats {
            live,
            idle,
            in_use: live.saturating_sub(idle),
            created: self.inner.created.load(Ordering::Acquire),
            closed: self.inner.retired.load(Ordering::Acquire),
            max_conns: self.inner.config.max_conns,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop the reaper and close every idle connection. Connections still in
    /// use are closed when they come back. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let _idle = lock(&self.inner.idle);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        self.shutdown.cancel();
        let reaper = lock(&self.reaper).take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        let drained: Vec<_> = lock(&self.inner.idle).drain(..).collect();
        let count = drained.len();
        for entry in drained {
            self.inner.retire(entry.conn).await;
        }
        self.inner.available.notify_waiters();
        self.inner.report_size();

        debug!(closed = count, "Connection pool closed");
        Ok(())
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A borrowed connection. Dropping it returns the connection to its pool.
pub struct PooledConnection {
    conn: Option<Box<dyn BrokerConnection>>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(|c| c.id()))
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn BrokerConnection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn.as_ref(),
            // Only `put`/`discard` take the connection, and they consume the guard.
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(conn) = self.pool.park(conn) {
                self.pool.retire_detached(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MemoryBroker;

    fn pool_with(broker: &MemoryBroker, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(broker.clone()),
            vec!["memory:0".to_string()],
            config,
        )
    }

    #[tokio::test]
    async fn test_get_reuses_returned_connection() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());

        let conn = pool.get().await.unwrap();
        let id = conn.id();
        pool.put(conn).await.unwrap();

        let again = pool.get().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_drop_returns_connection() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());

        {
            let _conn = pool.get().await.unwrap();
            assert_eq!(pool.stats().in_use, 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());

        let conn = pool.get().await.unwrap();
        let id = conn.id();
        pool.put(conn).await.unwrap();

        broker.disconnect_all();
        let fresh = pool.get().await.unwrap();
        assert_ne!(fresh.id(), id);
        assert!(fresh.is_alive());
        assert_eq!(pool.stats().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                max_conns: 1,
                acquire_timeout: Duration::from_millis(100),
                ..PoolConfig::default()
            },
        );

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, ClientError::PoolExhausted(1)));
    }

    #[tokio::test]
    async fn test_waiter_gets_returned_connection() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool_with(
            &broker,
            PoolConfig {
                max_conns: 1,
                ..PoolConfig::default()
            },
        ));

        let held = pool.get().await.unwrap();
        let id = held.id();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|c| c.id()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_put_closes_when_idle_full() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                max_idle: 1,
                ..PoolConfig::default()
            },
        );

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a).await.unwrap();
        pool.put(b).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(broker.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_reap_trims_to_idle_target() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                idle_target: 1,
                ..PoolConfig::default()
            },
        );

        let conns = vec![
            pool.get().await.unwrap(),
            pool.get().await.unwrap(),
            pool.get().await.unwrap(),
        ];
        for conn in conns {
            pool.put(conn).await.unwrap();
        }
        assert_eq!(pool.stats().idle, 3);

        assert_eq!(pool.reap().await, 2);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(broker.connections_closed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_closes_stale_connections() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                max_idle_time: Duration::from_secs(10),
                ..PoolConfig::default()
            },
        );

        let conn = pool.get().await.unwrap();
        pool.put(conn).await.unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(broker.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_get_and_put() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());

        let idle = pool.get().await.unwrap();
        let in_use = pool.get().await.unwrap();
        pool.put(idle).await.unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap();

        assert!(matches!(pool.get().await, Err(ClientError::PoolClosed)));
        assert!(matches!(pool.put(in_use).await, Err(ClientError::PoolClosed)));
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                max_conns: 1,
                ..PoolConfig::default()
            },
        );

        broker.fail_next_connects(1);
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailure(_)));
        assert_eq!(pool.stats().live, 0);

        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_warm_up_opens_idle_target() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());

        assert_eq!(pool.warm_up().await.unwrap(), 3);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(broker.connections_opened(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_put_racing_close_leaves_nothing_open() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool_with(
            &broker,
            PoolConfig {
                max_conns: 8,
                ..PoolConfig::default()
            },
        ));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let conn = match pool.get().await {
                        Ok(conn) => conn,
                        Err(ClientError::PoolClosed) => return,
                        Err(e) => panic!("unexpected error: {e}"),
                    };
                    tokio::task::yield_now().await;
                    if pool.put(conn).await.is_err() {
                        return;
                    }
                }
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.close().await.unwrap();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().live, 0);
        assert_eq!(broker.open_connections(), 0);
    }
}
