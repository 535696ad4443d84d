//! meridian-http — the connection lifecycle core of a concurrent,
//! multi-protocol HTTP client.
//!
//! This crate owns what happens *after* a request has been validated and
//! *before* the caller sees a response: buffer reuse, backoff math, HTTP/1.1
//! and HTTP/2 framing, per-host and global connection pooling, circuit
//! breaking, and retry orchestration. It deliberately does not own TCP/TLS
//! dialing, ALPN negotiation, DNS resolution, or a convenience
//! request-builder API — see each module's Non-goals.
//!
//! # Layout
//!
//! - [`buffer`]: tiered, refcounted byte buffer pool shared by both transports.
//! - [`backoff`]: pure delay-computation strategies for retries.
//! - [`classify`]: maps transport/pool errors onto a closed retry/breaker taxonomy.
//! - [`breaker`]: the circuit breaker admission gate, global or per-host.
//! - [`connection`]: the HTTP/1.1 and HTTP/2 transports.
//! - [`pool`]: per-host and global connection pooling.
//! - [`retry`]: the retry engine built on [`backoff`], [`classify`], and [`breaker`].
//! - [`executor`]: the end-to-end per-request algorithm tying everything together.
//! - [`tracer`]: optional synchronous tracing/metrics hooks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meridian_http::breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use meridian_http::buffer::{BufferPool, BufferPoolConfig};
//! use meridian_http::executor::{ExecutorConfig, RequestExecutor};
//! use meridian_http::pool::{ConnectionPool, ConnectionPoolConfig};
//! use meridian_http::retry::{RetryEngine, RetryPolicy};
//! use meridian_http::backoff::ExponentialBackoff;
//! use meridian_http::request::{Body, Request};
//! use meridian_http::ids::RequestIdGenerator;
//! use http::Method;
//! use std::time::Duration;
//!
//! # async fn build<C: meridian_http::pool::Connector + 'static>(connector: Arc<C>) {
//! let buffer_pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
//! let pool = ConnectionPool::new(ConnectionPoolConfig::new(), connector, buffer_pool);
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new());
//! let backoff = Box::new(ExponentialBackoff::new(
//!     Duration::from_millis(100), 2.0, Duration::from_secs(10), true,
//! ));
//! let retry = RetryEngine::new(RetryPolicy::new(), backoff, Arc::clone(&breaker));
//! let executor = RequestExecutor::new(pool, breaker, retry, ExecutorConfig::new());
//!
//! let ids = RequestIdGenerator::new();
//! let request = Request::new(
//!     Method::GET,
//!     "https://example.com/widgets".parse().unwrap(),
//!     http::HeaderMap::new(),
//!     Body::empty(),
//! ).unwrap();
//! let response = executor.execute(&request, ids.next_id()).await;
//! # let _ = response;
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod buffer;
pub mod classify;
pub mod connection;
pub mod error;
pub mod executor;
pub mod hostkey;
pub mod ids;
pub mod pool;
pub mod request;
pub mod response;
pub mod retry;
pub mod tracer;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, Outcome as BreakerOutcome, Scope as BreakerScope};
pub use buffer::{BufferPool, BufferPoolConfig, BufferRef};
pub use classify::{Categories, Category, ErrorClassifier};
pub use error::RequestError;
pub use executor::{ExecutorConfig, RequestExecutor};
pub use hostkey::{HostKey, Scheme};
pub use ids::{ConnectionId, RequestId};
pub use pool::{Acquired, ConnectionPool, ConnectionPoolConfig, Connector, HostPool, HostPoolConfig, NewConnection};
pub use request::{Body, Idempotency, Request, RewindableBody};
pub use response::{read_json, BodyReader, Response};
pub use retry::{AttemptFailure, Decision, RetryEngine, RetryPolicy};

/// The crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
