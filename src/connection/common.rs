//! Transport-agnostic connection identity, shared by [`super::h1::H1Connection`]
//! and [`super::h2::H2Connection`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::hostkey::HostKey;
use crate::ids::ConnectionId;

/// Which wire protocol a connection speaks. Fixed for the connection's
/// lifetime, decided by ALPN (or configuration, in the absence of TLS) at
/// connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    H1,
    H2,
}

/// Pool-visible lifecycle state (§3). A `Broken` or `Closed` connection never
/// transitions back to `Idle`; `HostPool` evicts it on next observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Closing,
    Closed,
    Broken,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Broken)
    }
}

/// Fields common to both transports: identity, timestamps, and pool state.
/// Protocol-specific substates (the H1 request/response state machine, or
/// the H2 stream table) live alongside this in the owning connection type.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    host: HostKey,
    protocol: Protocol,
    peer_addr: SocketAddr,
    created_at: Instant,
    last_used: Mutex<Instant>,
    request_count: AtomicU64,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(id: ConnectionId, host: HostKey, protocol: Protocol, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            host,
            protocol,
            peer_addr,
            created_at: now,
            last_used: Mutex::new(now),
            request_count: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Idle),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> &HostKey {
        &self.host
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state poisoned")
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("connection state poisoned") = state;
    }

    /// Age since the connection last served (or started) a request, used by
    /// the idle reaper against `max_keepalive`.
    pub fn idle_age(&self) -> Duration {
        self.last_used.lock().expect("connection state poisoned").elapsed()
    }

    /// Mark the start of a new unit of work: bumps `request_count` and resets
    /// `last_used` so the idle reaper doesn't collect a connection mid-flight.
    pub fn touch(&self) {
        *self.last_used.lock().expect("connection state poisoned") = Instant::now();
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkey::Scheme;

    fn meta() -> Connection {
        Connection::new(
            ConnectionId::default_for_test(),
            HostKey::new(Scheme::Https, "example.com", 443),
            Protocol::H1,
            "127.0.0.1:443".parse().unwrap(),
        )
    }

    #[test]
    fn starts_idle_with_zero_requests() {
        let c = meta();
        assert_eq!(c.state(), ConnectionState::Idle);
        assert_eq!(c.request_count(), 0);
    }

    #[test]
    fn touch_increments_request_count_and_resets_idle_age() {
        let c = meta();
        c.touch();
        c.touch();
        assert_eq!(c.request_count(), 2);
        assert!(c.idle_age() < Duration::from_secs(1));
    }

    #[test]
    fn terminal_states_are_broken_or_closed() {
        assert!(ConnectionState::Broken.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Idle.is_terminal());
    }
}

#[cfg(test)]
impl ConnectionId {
    pub(crate) fn default_for_test() -> Self {
        crate::ids::ConnectionIdGenerator::new().next_id()
    }
}
