//! The closed error taxonomy consulted by the classifier, retry engine, and
//! circuit breaker.
//!
//! Modeled on the constructor-helper style of `TransportError` in the
//! teacher crate: one `thiserror` enum with a human-readable `#[error(...)]`
//! message per variant, plus `impl` helpers so callers don't spell out
//! struct-variant field names at every call site.

use std::time::Duration;

use crate::ids::RequestId;

/// One row of the closed error taxonomy. Every transport or pool failure is
/// mapped into exactly one of these variants before it reaches the retry
/// engine or the caller.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Malformed URL, header, or method. Never retried, never trips a breaker.
    #[error("request {id}: validation failed: {message}")]
    Validation { id: Option<RequestId>, message: String },

    /// TCP/TLS handshake exceeded `connect_timeout`.
    #[error("request {id}: connect timed out after {elapsed:?}")]
    ConnectTimeout { id: RequestId, elapsed: Duration },

    /// Bytes not received within `read_timeout`.
    #[error("request {id}: read timed out after {elapsed:?}")]
    ReadTimeout { id: RequestId, elapsed: Duration },

    /// Socket-level failure: refused, reset, or broken mid-transfer.
    #[error("request {id}: connection error: {message}")]
    Connection { id: RequestId, message: String },

    /// Framing or HPACK violation, or an unexpected frame. Fatal for the
    /// connection that produced it; only retryable if provably
    /// pre-processing (see `RetryEngine`).
    #[error("request {id}: protocol error: {message}")]
    Protocol { id: RequestId, message: String },

    /// 4xx/5xx surfaced via `raise_for_status`.
    #[error("request {id}: HTTP {status} {reason}")]
    Http {
        id: RequestId,
        status: u16,
        reason: String,
    },

    /// Redirect chain exceeded the configured maximum (handled by the outer
    /// convenience layer; the core only forwards the count it was given).
    #[error("request {id}: exceeded {max} redirects")]
    TooManyRedirects { id: RequestId, max: u32 },

    /// An H2 stream whose id was above the peer's GOAWAY
    /// `last_processed_stream_id`: the server provably never acted on it, so
    /// it is retry-eligible regardless of idempotency.
    #[error("request {id}: stream not processed by peer before GOAWAY")]
    NotProcessedByPeer { id: RequestId },

    /// The circuit breaker rejected the request without attempting I/O.
    #[error("request {id}: circuit open for {host}")]
    CircuitOpen { id: RequestId, host: String },

    /// Acquiring a pool connection timed out waiting for capacity.
    #[error("request {id}: pool exhausted waiting for {host} ({waited:?})")]
    PoolExhausted {
        id: RequestId,
        host: String,
        waited: Duration,
    },

    /// The caller cancelled the request, or the overall deadline elapsed.
    #[error("request {id}: cancelled")]
    Cancelled { id: RequestId },
}

impl RequestError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            id: None,
            message: message.into(),
        }
    }

    pub fn validation_for(id: RequestId, message: impl Into<String>) -> Self {
        Self::Validation {
            id: Some(id),
            message: message.into(),
        }
    }

    pub fn connect_timeout(id: RequestId, elapsed: Duration) -> Self {
        Self::ConnectTimeout { id, elapsed }
    }

    pub fn read_timeout(id: RequestId, elapsed: Duration) -> Self {
        Self::ReadTimeout { id, elapsed }
    }

    pub fn connection(id: RequestId, message: impl Into<String>) -> Self {
        Self::Connection {
            id,
            message: message.into(),
        }
    }

    pub fn protocol(id: RequestId, message: impl Into<String>) -> Self {
        Self::Protocol {
            id,
            message: message.into(),
        }
    }

    pub fn http(id: RequestId, status: u16, reason: impl Into<String>) -> Self {
        Self::Http {
            id,
            status,
            reason: reason.into(),
        }
    }

    pub fn too_many_redirects(id: RequestId, max: u32) -> Self {
        Self::TooManyRedirects { id, max }
    }

    pub fn not_processed_by_peer(id: RequestId) -> Self {
        Self::NotProcessedByPeer { id }
    }

    pub fn circuit_open(id: RequestId, host: impl Into<String>) -> Self {
        Self::CircuitOpen {
            id,
            host: host.into(),
        }
    }

    pub fn pool_exhausted(id: RequestId, host: impl Into<String>, waited: Duration) -> Self {
        Self::PoolExhausted {
            id,
            host: host.into(),
            waited,
        }
    }

    pub fn cancelled(id: RequestId) -> Self {
        Self::Cancelled { id }
    }

    /// The request id this error is attached to, when one was assigned.
    ///
    /// `Validation` errors raised before a request is admitted (bad URL
    /// supplied to a builder, say) carry no id.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Validation { id, .. } => *id,
            Self::ConnectTimeout { id, .. }
            | Self::ReadTimeout { id, .. }
            | Self::Connection { id, .. }
            | Self::Protocol { id, .. }
            | Self::Http { id, .. }
            | Self::TooManyRedirects { id, .. }
            | Self::CircuitOpen { id, .. }
            | Self::PoolExhausted { id, .. }
            | Self::NotProcessedByPeer { id, .. }
            | Self::Cancelled { id, .. } => Some(*id),
        }
    }

    /// `true` for 4xx statuses surfaced via `raise_for_status`.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Http { status, .. } if (400..500).contains(status))
    }

    /// `true` for 5xx statuses surfaced via `raise_for_status`.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Http { status, .. } if (500..600).contains(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_id_and_detail() {
        let id = RequestId::default_for_test();
        let err = RequestError::connection(id, "reset by peer");
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn http_error_classifies_client_vs_server() {
        let id = RequestId::default_for_test();
        assert!(RequestError::http(id, 404, "Not Found").is_client_error());
        assert!(RequestError::http(id, 503, "Service Unavailable").is_server_error());
        assert!(!RequestError::http(id, 200, "OK").is_client_error());
    }

    #[test]
    fn validation_without_id_has_no_request_id() {
        let err = RequestError::validation("bad url");
        assert!(err.request_id().is_none());
    }
}

#[cfg(test)]
impl RequestId {
    /// Test-only convenience: a fixed id for assertions that don't care
    /// which one they get.
    pub(crate) fn default_for_test() -> Self {
        crate::ids::RequestIdGenerator::new().next_id()
    }
}
