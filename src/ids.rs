//! Diagnostic identifiers.
//!
//! `RequestId` tags every [`crate::request::Request`] at submission time so
//! tracer and metrics callbacks, and log lines emitted across retries, can be
//! correlated back to a single logical call. It never touches the wire.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque, process-unique identifier assigned to a request at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl RequestId {
    /// Sentinel id for errors detected on a shared connection before (or
    /// without) a specific request in scope — a handshake failure, a
    /// framing error on the H2 reader loop. `RequestIdGenerator` never
    /// issues `0`, so this can't collide with a real id.
    pub fn connection_scoped() -> Self {
        RequestId(0)
    }
}

/// Thread-safe generator for [`RequestId`] values.
///
/// Backed by an atomic counter so it can be shared across tasks without
/// locking; ids are unique for the lifetime of the process.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    /// Create a generator whose first id is 1.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Generate the next unique id.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Connection identity within a [`crate::hostkey::HostKey`]'s pool.
///
/// Unique only within the pool that issued it, not globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

/// Generator for [`ConnectionId`]s, one per [`crate::pool::HostPool`].
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
    counter: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_are_unique_and_sequential() {
        let gen = RequestIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        let c = gen.next_id();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a < b && b < c);
    }

    #[test]
    fn ids_are_unique_under_concurrency() {
        let gen = Arc::new(RequestIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                thread::spawn(move || (0..50).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id generated: {id}");
            }
        }
        assert_eq!(all.len(), 8 * 50);
    }
}
