//! The capability interface a `HostPool` uses to establish new connections.
//!
//! The core deliberately does not own TCP/TLS dialing or ALPN negotiation;
//! callers supply a [`Connector`] that does, and hand back whichever
//! transport ALPN settled on.

use std::sync::Arc;

use crate::connection::h1::{AsyncIo, H1Connection};
use crate::connection::h2::H2Connection;
use crate::error::RequestError;
use crate::hostkey::HostKey;
use crate::ids::RequestId;

/// A freshly established connection, tagged with the protocol ALPN (or the
/// connector's own policy) actually negotiated.
pub enum NewConnection {
    H1(H1Connection<Box<dyn AsyncIo>>),
    H2(H2Connection),
}

/// Establishes new transport connections to a host. Implemented by the
/// outer layer that owns socket/TLS concerns; the core only consumes it.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &HostKey, prefer_h2: bool, id: RequestId) -> Result<NewConnection, RequestError>;
}

/// A connector wired to an in-process pair, used by tests to exercise the
/// pool without real sockets. Each call to `connect` drains one prepared
/// connection from the front of its queue.
#[cfg(test)]
pub struct QueueConnector {
    queue: std::sync::Mutex<std::collections::VecDeque<NewConnection>>,
}

#[cfg(test)]
impl QueueConnector {
    pub fn new(conns: Vec<NewConnection>) -> Arc<Self> {
        Arc::new(Self {
            queue: std::sync::Mutex::new(conns.into()),
        })
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl Connector for QueueConnector {
    async fn connect(&self, _host: &HostKey, _prefer_h2: bool, id: RequestId) -> Result<NewConnection, RequestError> {
        self.queue
            .lock()
            .expect("queue connector poisoned")
            .pop_front()
            .ok_or_else(|| RequestError::connection(id, "test connector queue exhausted"))
    }
}
