//! The immutable [`Request`] value submitted to [`crate::executor::RequestExecutor`].

use std::time::Duration;

use http::{HeaderMap, Method, Uri};

/// A request body. Once submitted, a `Request` is immutable; the body is the
/// one place that tracks whether a retry can safely resend it.
pub enum Body {
    Empty,
    Bytes(bytes::Bytes),
    /// A finite stream of byte chunks with an optional known length and a
    /// `rewind` capability. Per §4.8, a body without `rewind` disables retry
    /// for that request (treated as non-idempotent). Wrapped in a `Mutex` so
    /// a transport can pull chunks through `&Request`/`&Body` — the executor
    /// and connections never get a `&mut Request`.
    Stream(std::sync::Mutex<Box<dyn RewindableBody>>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_bytes(bytes: impl Into<bytes::Bytes>) -> Self {
        Body::Bytes(bytes.into())
    }

    pub fn from_stream(stream: impl RewindableBody + 'static) -> Self {
        Body::Stream(std::sync::Mutex::new(Box::new(stream)))
    }

    /// Whether the engine is allowed to resend this body on retry.
    pub fn is_resendable(&self) -> bool {
        match self {
            Body::Empty | Body::Bytes(_) => true,
            Body::Stream(s) => s.lock().expect("stream body poisoned").can_rewind(),
        }
    }

    pub fn known_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream(s) => s.lock().expect("stream body poisoned").known_length(),
        }
    }

    /// Pull the next chunk of a streamed body. A no-op returning `None` for
    /// `Empty`/`Bytes`, whose bytes are sent whole by the transports instead.
    pub(crate) fn next_stream_chunk(&self) -> Option<bytes::Bytes> {
        match self {
            Body::Empty | Body::Bytes(_) => None,
            Body::Stream(s) => s.lock().expect("stream body poisoned").next_chunk(),
        }
    }

    /// Reset a streamed body before a retry resend. A no-op for `Empty`/`Bytes`.
    pub(crate) fn rewind_for_retry(&self) {
        if let Body::Stream(s) = self {
            s.lock().expect("stream body poisoned").rewind();
        }
    }
}

/// Capability interface for a streamed request body that can be rewound for
/// retry. Consumers depend on the capability, not a concrete type, so any
/// streaming body implementation can plug in without `Body` knowing about it.
pub trait RewindableBody: Send + Sync {
    fn known_length(&self) -> Option<u64>;
    fn can_rewind(&self) -> bool;
    /// Reset the stream to its start. Only called when `can_rewind()` is true.
    fn rewind(&mut self);
    /// Pull the next chunk, or `None` at end of stream.
    fn next_chunk(&mut self) -> Option<bytes::Bytes>;
}

/// Whether repeating a request is safe per HTTP semantics (RFC 7231 §4.2.2),
/// used by the retry engine to decide if an indeterminate failure is safe to
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

fn default_idempotency(method: &Method) -> Idempotency {
    match *method {
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE => {
            Idempotency::Idempotent
        }
        _ => Idempotency::NonIdempotent,
    }
}

/// An immutable, fully-resolved HTTP request.
pub struct Request {
    method: Method,
    url: Uri,
    headers: HeaderMap,
    body: Body,
    timeout: Option<Duration>,
    idempotent: Idempotency,
}

impl Request {
    /// Build a request, validating the URL has a scheme/authority and the
    /// method is non-empty (the method type already guarantees non-empty).
    /// Header CR/LF validation is the caller's responsibility via `http`'s
    /// `HeaderValue` constructors, which already reject them.
    pub fn new(method: Method, url: Uri, headers: HeaderMap, body: Body) -> Result<Self, crate::error::RequestError> {
        if url.scheme_str() != Some("http") && url.scheme_str() != Some("https") {
            return Err(crate::error::RequestError::validation(format!(
                "unsupported URL scheme: {:?}",
                url.scheme_str()
            )));
        }
        if url.authority().is_none() {
            return Err(crate::error::RequestError::validation("URL is missing a host"));
        }
        let idempotent = default_idempotency(&method);
        Ok(Self {
            method,
            url,
            headers,
            body,
            timeout: None,
            idempotent,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the derived idempotency, e.g. a `POST` the caller knows is
    /// safe to repeat.
    pub fn with_idempotency(mut self, idempotent: Idempotency) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent == Idempotency::Idempotent
    }

    pub fn host_key(&self) -> Result<crate::hostkey::HostKey, crate::error::RequestError> {
        crate::hostkey::HostKey::from_uri(&self.url)
    }
}
