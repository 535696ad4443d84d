//! Connection pooling (§4.5, §4.6): per-host sub-pools wrapped by a single
//! globally-capped [`ConnectionPool`].

mod connection_pool;
mod connector;
mod host_pool;

pub use connection_pool::{ConnectionPool, ConnectionPoolConfig};
pub use connector::{Connector, NewConnection};
pub use host_pool::{Acquired, BoxedH1, HostPool, HostPoolConfig};

#[cfg(test)]
pub use connector::QueueConnector;
