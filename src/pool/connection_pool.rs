//! Global connection pool (§4.6): partitions per-host sub-pools, enforces
//! one `max_connections` cap across all of them, and arbitrates cross-host
//! pressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::buffer::BufferPool;
use crate::error::RequestError;
use crate::hostkey::HostKey;
use crate::ids::RequestId;

use super::connector::Connector;
use super::host_pool::{Acquired, HostPool, HostPoolConfig};

#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    pub max_connections: usize,
    pub per_host: HostPoolConfig,
    /// Upper bound on how long a caller waits on the global FIFO queue once
    /// both the per-host and global caps are saturated and no eviction is
    /// possible.
    pub global_wait_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPoolConfig {
    pub fn new() -> Self {
        Self {
            max_connections: 256,
            per_host: HostPoolConfig::new(),
            global_wait_timeout: Duration::from_secs(10),
        }
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn per_host(mut self, config: HostPoolConfig) -> Self {
        self.per_host = config;
        self
    }
}

/// A FIFO admission ticket: callers park behind one of these when both caps
/// are saturated and no cross-host eviction is possible.
struct Ticket {
    notify: Arc<Notify>,
}

/// Partitions connections by [`HostKey`] and enforces a single global cap
/// (§4.6). One instance should be shared per scheduler, per the design
/// notes' "one scheduler owns one ConnectionPool" contract.
pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    connector: Arc<dyn Connector>,
    hosts: DashMap<HostKey, Arc<HostPool>>,
    total_connections: AtomicUsize,
    wait_queue: Mutex<VecDeque<Ticket>>,
    buffer_pool: Arc<BufferPool>,
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig, connector: Arc<dyn Connector>, buffer_pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            hosts: DashMap::new(),
            total_connections: AtomicUsize::new(0),
            wait_queue: Mutex::new(VecDeque::new()),
            buffer_pool,
        })
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    fn host_pool(&self, host: &HostKey) -> Arc<HostPool> {
        self.hosts
            .entry(host.clone())
            .or_insert_with(|| HostPool::new(host.clone(), self.config.per_host.clone(), Arc::clone(&self.connector)))
            .clone()
    }

    /// `acquire(allow_new, prefer_h2)` per §4.6. Serves an existing
    /// connection when one is available; otherwise creates a new one
    /// subject to both the per-host and global caps, suspending on a FIFO
    /// queue when both are saturated and no host has idle capacity to
    /// evict.
    pub async fn acquire(
        &self,
        host: &HostKey,
        allow_new: bool,
        prefer_h2: bool,
        id: RequestId,
    ) -> Result<Acquired, RequestError> {
        let host_pool = self.host_pool(host);
        let deadline = Instant::now() + self.config.global_wait_timeout;

        loop {
            // Fast path: something already usable, no need to touch the
            // global cap at all.
            if let Ok(acquired) = host_pool.acquire(prefer_h2, id).await {
                return Ok(acquired);
            }
            if !allow_new {
                return Err(RequestError::pool_exhausted(id, host.to_string(), self.config.global_wait_timeout));
            }

            let host_total = host_pool.total_count().await;
            if host_pool.is_at_capacity_blocking(host_total) {
                // Per-host cap is the bottleneck, not the global one; the
                // host pool's own `acquire` above already waited out its
                // budget, so surface the timeout.
                return Err(RequestError::pool_exhausted(id, host.to_string(), self.config.per_host.wait_timeout));
            }

            if self.total_connections.load(Ordering::Acquire) >= self.config.max_connections {
                if !self.evict_cross_host(host).await {
                    if self.park_on_global_queue(deadline).await.is_err() {
                        return Err(RequestError::pool_exhausted(id, host.to_string(), self.config.global_wait_timeout));
                    }
                    continue;
                }
            }

            self.total_connections.fetch_add(1, Ordering::AcqRel);
            match host_pool.create_new(prefer_h2, id).await {
                Ok(acquired) => return Ok(acquired),
                Err(e) => {
                    self.total_connections.fetch_sub(1, Ordering::AcqRel);
                    self.wake_next_waiter();
                    return Err(e);
                }
            }
        }
    }

    /// Cross-host eviction under global pressure (§4.6): pick the host pool
    /// with the largest idle set and evict its LRU idle connection.
    async fn evict_cross_host(&self, requesting_host: &HostKey) -> bool {
        let candidates: Vec<(HostKey, Arc<HostPool>)> =
            self.hosts.iter().map(|entry| (entry.key().clone(), Arc::clone(entry.value()))).collect();

        let mut best: Option<(HostKey, Arc<HostPool>, usize)> = None;
        for (key, pool) in candidates {
            let idle = pool.idle_count().await;
            if idle > 0 && best.as_ref().map_or(true, |(_, _, n)| idle > *n) {
                best = Some((key, pool, idle));
            }
        }
        let Some((victim_host, victim, _)) = best else {
            return false;
        };
        let evicted = victim.evict_lru_idle().await;
        if evicted {
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            trace!(requesting_host = %requesting_host, victim_host = %victim_host, "evicted idle connection under global pressure");
        }
        evicted
    }

    async fn park_on_global_queue(&self, deadline: Instant) -> Result<(), ()> {
        let notify = Arc::new(Notify::new());
        self.wait_queue.lock().expect("connection pool poisoned").push_back(Ticket {
            notify: Arc::clone(&notify),
        });
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(());
        }
        tokio::select! {
            _ = notify.notified() => Ok(()),
            _ = tokio::time::sleep(remaining) => Err(()),
        }
    }

    fn wake_next_waiter(&self) {
        if let Some(ticket) = self.wait_queue.lock().expect("connection pool poisoned").pop_front() {
            ticket.notify.notify_one();
        }
    }

    /// Release an H1 connection after use. Frees a global slot if the
    /// connection was destroyed rather than returned to idle.
    pub async fn release_h1(&self, host: &HostKey, conn: super::host_pool::BoxedH1) {
        let host_pool = self.host_pool(host);
        let destroyed = host_pool.release_h1(conn).await;
        if destroyed {
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
        }
        self.wake_next_waiter();
    }

    /// Drop a now-broken/closed H2 connection, freeing its global slot.
    pub async fn drop_h2(&self, host: &HostKey, conn: &crate::connection::h2::H2Connection) {
        let host_pool = self.host_pool(host);
        if host_pool.drop_h2(conn.meta()).await {
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            self.wake_next_waiter();
        }
    }

    pub fn total_connections(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::connection::h1::{AsyncIo, H1Connection};
    use crate::connection::{Connection, Protocol};
    use crate::hostkey::Scheme;
    use crate::ids::ConnectionIdGenerator;
    use crate::pool::connector::{NewConnection, QueueConnector};

    fn host(name: &str) -> HostKey {
        HostKey::new(Scheme::Https, name, 443)
    }

    fn fresh_h1_conn(ids: &ConnectionIdGenerator, host: HostKey) -> super::super::host_pool::BoxedH1 {
        let (a, _b) = tokio::io::duplex(64);
        let meta = Arc::new(Connection::new(ids.next_id(), host, Protocol::H1, "127.0.0.1:443".parse().unwrap()));
        let pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        H1Connection::new(meta, Box::new(a) as Box<dyn AsyncIo>, pool)
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_after_release() {
        let ids = ConnectionIdGenerator::new();
        let h = host("a.example.com");
        let connector = QueueConnector::new(vec![NewConnection::H1(fresh_h1_conn(&ids, h.clone()))]);
        let buffer_pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        let pool = ConnectionPool::new(ConnectionPoolConfig::new(), connector, buffer_pool);
        let id = RequestId::default_for_test();

        let acquired = pool.acquire(&h, true, false, id).await.unwrap();
        assert_eq!(pool.total_connections(), 1);
        let Acquired::H1(conn) = acquired else { panic!("expected H1") };
        pool.release_h1(&h, conn).await;
        assert_eq!(pool.total_connections(), 1, "returning to idle keeps the slot counted");
    }

    #[tokio::test]
    async fn global_cap_of_zero_rejects_new_connections() {
        let h = host("a.example.com");
        let connector = QueueConnector::new(vec![]);
        let buffer_pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        let config = ConnectionPoolConfig::new().max_connections(0);
        let pool = ConnectionPool::new(config, connector, buffer_pool);
        let id = RequestId::default_for_test();
        let result = tokio::time::timeout(Duration::from_millis(200), pool.acquire(&h, true, false, id)).await;
        assert!(result.is_err() || result.unwrap().is_err());
    }
}
