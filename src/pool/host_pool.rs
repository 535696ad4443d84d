//! Per-host connection sub-pool (§4.5): acquisition, selection policy, and
//! idle reaping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::connection::h1::{AsyncIo, H1Connection};
use crate::connection::h2::H2Connection;
use crate::connection::{Connection as ConnMeta, ConnectionState};
use crate::error::RequestError;
use crate::hostkey::HostKey;
use crate::ids::RequestId;

use super::connector::{Connector, NewConnection};

pub type BoxedH1 = H1Connection<Box<dyn AsyncIo>>;

/// A connection handed out by [`HostPool::acquire`]. `H1` is exclusively
/// owned by the caller until released; `H2` is a cheap clone that shares
/// the connection's reader/writer loops and can be handed to many callers
/// concurrently, bounded by its own stream admission.
pub enum Acquired {
    H1(BoxedH1),
    H2(H2Connection),
}

#[derive(Debug, Clone)]
pub struct HostPoolConfig {
    pub max_connections_per_host: usize,
    pub max_keepalive: Duration,
    pub wait_timeout: Duration,
    pub reap_interval: Duration,
    pub reap_batch_size: usize,
}

impl Default for HostPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPoolConfig {
    pub fn new() -> Self {
        Self {
            max_connections_per_host: 32,
            max_keepalive: Duration::from_secs(300),
            wait_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(30),
            reap_batch_size: 16,
        }
    }

    pub fn max_connections_per_host(mut self, n: usize) -> Self {
        self.max_connections_per_host = n;
        self
    }

    pub fn max_keepalive(mut self, d: Duration) -> Self {
        self.max_keepalive = d;
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }
}

#[derive(Default)]
struct Inner {
    h1_idle: VecDeque<BoxedH1>,
    h1_in_use: usize,
    h2_conns: Vec<H2Connection>,
    /// Slots reserved for an in-flight `connect()` that hasn't resolved yet,
    /// so a second caller doesn't also see spare capacity and over-connect.
    pending: usize,
}

impl Inner {
    fn total(&self) -> usize {
        self.h1_idle.len() + self.h1_in_use + self.h2_conns.len() + self.pending
    }

    fn idle_count(&self) -> usize {
        self.h1_idle.len()
    }

    /// MRU idle H1 connection, tie-broken by lowest `request_count` (§4.5).
    fn pop_best_h1(&mut self) -> Option<BoxedH1> {
        if self.h1_idle.is_empty() {
            return None;
        }
        let mut best_idx = 0;
        let mut best_last_used = Duration::MAX;
        let mut best_requests = u64::MAX;
        for (idx, conn) in self.h1_idle.iter().enumerate() {
            let age = conn.meta().idle_age();
            let requests = conn.meta().request_count();
            if age < best_last_used || (age == best_last_used && requests < best_requests) {
                best_idx = idx;
                best_last_used = age;
                best_requests = requests;
            }
        }
        self.h1_idle.remove(best_idx)
    }
}

/// Per-host sub-pool. Owns a background idle reaper that runs while the
/// pool is alive, stopped via `shutdown`/`Drop` the same way
/// [`crate::breaker::CircuitBreaker`]'s sweeper is.
pub struct HostPool {
    host: HostKey,
    config: HostPoolConfig,
    connector: Arc<dyn Connector>,
    inner: AsyncMutex<Inner>,
    notify: Notify,
    shutdown: Arc<AtomicBool>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HostPool {
    pub fn new(host: HostKey, config: HostPoolConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let pool = Arc::new(Self {
            host,
            config,
            connector,
            inner: AsyncMutex::new(Inner::default()),
            notify: Notify::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            reaper: std::sync::Mutex::new(None),
        });
        let handle = Arc::clone(&pool).spawn_reaper();
        *pool.reaper.lock().expect("host pool poisoned") = Some(handle);
        pool
    }

    pub fn host(&self) -> &HostKey {
        &self.host
    }

    fn spawn_reaper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.reap_interval);
            loop {
                interval.tick().await;
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.reap_once().await;
            }
        })
    }

    async fn reap_once(&self) {
        let mut inner = self.inner.lock().await;
        let mut reaped = 0;
        let mut i = 0;
        while i < inner.h1_idle.len() && reaped < self.config.reap_batch_size {
            if inner.h1_idle[i].meta().idle_age() > self.config.max_keepalive {
                inner.h1_idle.remove(i);
                reaped += 1;
            } else {
                i += 1;
            }
        }
        inner
            .h2_conns
            .retain(|c| !c.meta().state().is_terminal());
        if reaped > 0 {
            trace!(host = %self.host, reaped, "idle reaper evicted connections");
            self.notify.notify_waiters();
        }
    }

    /// Non-blocking: serve from an existing H2 connection with spare stream
    /// capacity, or the best idle H1 connection. Never creates a new
    /// connection.
    async fn try_acquire_existing(&self, prefer_h2: bool) -> Option<Acquired> {
        let mut inner = self.inner.lock().await;
        if prefer_h2 {
            if let Some(conn) = inner.h2_conns.iter().find(|c| c.has_stream_capacity()).cloned() {
                return Some(Acquired::H2(conn));
            }
        }
        if let Some(conn) = inner.pop_best_h1() {
            inner.h1_in_use += 1;
            return Some(Acquired::H1(conn));
        }
        if !prefer_h2 {
            if let Some(conn) = inner.h2_conns.iter().find(|c| c.has_stream_capacity()).cloned() {
                return Some(Acquired::H2(conn));
            }
        }
        None
    }

    /// Current total connection count against `max_connections_per_host`,
    /// including any in-flight `connect()`.
    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.total()
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle_count()
    }

    pub fn is_at_capacity_blocking(&self, total: usize) -> bool {
        total >= self.config.max_connections_per_host
    }

    /// Acquire an existing connection, blocking up to `wait_timeout` for one
    /// to free up. Never creates a new connection — that's
    /// [`HostPool::create_new`], called by `ConnectionPool` once it has
    /// confirmed both per-host and global headroom.
    pub async fn acquire(&self, prefer_h2: bool, id: RequestId) -> Result<Acquired, RequestError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            if let Some(acquired) = self.try_acquire_existing(prefer_h2).await {
                return Ok(acquired);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RequestError::pool_exhausted(id, self.host.to_string(), self.config.wait_timeout));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(RequestError::pool_exhausted(id, self.host.to_string(), self.config.wait_timeout));
                }
            }
        }
    }

    /// Reserve a slot and connect. The caller must have already verified
    /// there is room (per-host and global); this only guards against two
    /// concurrent `create_new` calls both seeing the same spare per-host
    /// slot.
    pub async fn create_new(&self, prefer_h2: bool, id: RequestId) -> Result<Acquired, RequestError> {
        {
            let mut inner = self.inner.lock().await;
            inner.pending += 1;
        }
        let result = self.connector.connect(&self.host, prefer_h2, id).await;
        let mut inner = self.inner.lock().await;
        inner.pending -= 1;
        match result {
            Ok(NewConnection::H1(conn)) => {
                inner.h1_in_use += 1;
                Ok(Acquired::H1(conn))
            }
            Ok(NewConnection::H2(conn)) => {
                inner.h2_conns.push(conn.clone());
                Ok(Acquired::H2(conn))
            }
            Err(e) => {
                self.notify.notify_waiters();
                Err(e)
            }
        }
    }

    /// Return an H1 connection after use. Returns `true` if the connection
    /// was destroyed (not returned to idle) — the caller (`ConnectionPool`)
    /// uses this to decide whether to release a global slot too.
    pub async fn release_h1(&self, conn: BoxedH1) -> bool {
        let mut inner = self.inner.lock().await;
        inner.h1_in_use -= 1;
        let destroyed = conn.meta().state() != ConnectionState::Idle;
        if !destroyed {
            inner.h1_idle.push_back(conn);
        }
        drop(inner);
        self.notify.notify_waiters();
        destroyed
    }

    /// Drop a now-broken/closed H2 connection from the table. Returns
    /// `true` if it was found and removed (vs. already pruned by the
    /// reaper).
    pub async fn drop_h2(&self, meta: &Arc<ConnMeta>) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.h2_conns.len();
        inner.h2_conns.retain(|c| c.meta().id() != meta.id());
        let removed = inner.h2_conns.len() != before;
        drop(inner);
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    /// Evict the host's LRU idle H1 connection, used by `ConnectionPool`
    /// under global cross-host pressure (§4.6). Returns whether one existed.
    pub async fn evict_lru_idle(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.pop_best_h1() {
            drop(conn);
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reaper.lock().expect("host pool poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for HostPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferPoolConfig};
    use crate::connection::h1::H1Connection;
    use crate::connection::{Connection, Protocol};
    use crate::hostkey::Scheme;
    use crate::ids::ConnectionIdGenerator;
    use crate::pool::connector::QueueConnector;

    fn host() -> HostKey {
        HostKey::new(Scheme::Https, "example.com", 443)
    }

    fn fresh_h1_conn(ids: &ConnectionIdGenerator) -> BoxedH1 {
        let (a, _b) = tokio::io::duplex(64);
        let meta = Arc::new(Connection::new(ids.next_id(), host(), Protocol::H1, "127.0.0.1:443".parse().unwrap()));
        let pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        H1Connection::new(meta, Box::new(a) as Box<dyn AsyncIo>, pool)
    }

    #[tokio::test]
    async fn creates_new_connection_when_pool_is_empty() {
        let ids = ConnectionIdGenerator::new();
        let connector = QueueConnector::new(vec![NewConnection::H1(fresh_h1_conn(&ids))]);
        let pool = HostPool::new(host(), HostPoolConfig::new(), connector);
        let id = RequestId::default_for_test();
        assert!(pool.try_acquire_existing(false).await.is_none());
        let acquired = pool.create_new(false, id).await.unwrap();
        assert!(matches!(acquired, Acquired::H1(_)));
        assert_eq!(pool.total_count().await, 1);
    }

    #[tokio::test]
    async fn released_idle_connection_is_reused() {
        let ids = ConnectionIdGenerator::new();
        let connector = QueueConnector::new(vec![NewConnection::H1(fresh_h1_conn(&ids))]);
        let pool = HostPool::new(host(), HostPoolConfig::new(), connector);
        let id = RequestId::default_for_test();
        let acquired = pool.create_new(false, id).await.unwrap();
        let Acquired::H1(conn) = acquired else { panic!("expected H1") };
        let destroyed = pool.release_h1(conn).await;
        assert!(!destroyed);
        assert_eq!(pool.idle_count().await, 1);

        let reused = pool.acquire(false, id).await.unwrap();
        assert!(matches!(reused, Acquired::H1(_)));
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn broken_connection_is_not_returned_to_idle() {
        let ids = ConnectionIdGenerator::new();
        let connector = QueueConnector::new(vec![NewConnection::H1(fresh_h1_conn(&ids))]);
        let pool = HostPool::new(host(), HostPoolConfig::new(), connector);
        let id = RequestId::default_for_test();
        let acquired = pool.create_new(false, id).await.unwrap();
        let Acquired::H1(conn) = acquired else { panic!("expected H1") };
        conn.meta().set_state(ConnectionState::Broken);
        let destroyed = pool.release_h1(conn).await;
        assert!(destroyed);
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(pool.total_count().await, 0);
    }
}
