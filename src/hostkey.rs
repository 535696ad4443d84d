//! `HostKey` — the connection pool's partition key.

use std::fmt;

/// URI scheme a [`HostKey`] was partitioned under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// `(scheme, lowercase host, port)` — partitions the connection pool.
///
/// Two requests share a [`HostPool`](crate::pool::HostPool) iff their
/// `HostKey`s are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl HostKey {
    /// Build a key from an already-lowercased host. Prefer [`HostKey::from_uri`]
    /// when parsing untrusted input.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derive a `HostKey` from an `http::Uri`'s authority, lowercasing the
    /// host and filling in the scheme's default port when absent.
    pub fn from_uri(uri: &http::Uri) -> Result<Self, crate::error::RequestError> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            other => {
                return Err(crate::error::RequestError::validation(format!(
                    "unsupported or missing URL scheme: {other:?}"
                )))
            }
        };
        let authority = uri.authority().ok_or_else(|| {
            crate::error::RequestError::validation("URL is missing a host".to_string())
        })?;
        let port = authority.port_u16().unwrap_or_else(|| scheme.default_port());
        Ok(Self::new(scheme, authority.host(), port))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}
