//! Maps a [`RequestError`] onto the closed set of retry/breaker categories.

use crate::error::RequestError;

/// Retry/breaker category a failure is classified into.
///
/// `ValidationError`, `ProtocolError` (outside the GOAWAY pre-processing
/// case), `TooManyRedirects`, `CircuitOpen`, and `Cancelled` classify to the
/// empty set: they are never retried and never trip a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    Transient,
    Timeout,
    Server,
    RateLimit,
    Connection,
}

const ALL_CATEGORIES: [Category; 5] =
    [Category::Transient, Category::Timeout, Category::Server, Category::RateLimit, Category::Connection];

/// A small set of [`Category`] values. Some taxonomy rows belong to more than
/// one category at once — a connection reset is both `CONNECTION` and
/// `TRANSIENT` — so callers must check membership with [`Categories::contains`]
/// rather than assume `classify` ever returns exactly one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Categories(u8);

impl Categories {
    const fn bit(category: Category) -> u8 {
        1 << category as u8
    }

    pub const fn none() -> Self {
        Categories(0)
    }

    pub const fn of(category: Category) -> Self {
        Categories(Self::bit(category))
    }

    /// Add `category` to the set.
    pub const fn and(self, category: Category) -> Self {
        Categories(self.0 | Self::bit(category))
    }

    pub fn contains(self, category: Category) -> bool {
        self.0 & Self::bit(category) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether any category in this set is also in `other`.
    pub fn intersects(self, other: &[Category]) -> bool {
        other.iter().any(|c| self.contains(*c))
    }

    pub fn iter(self) -> impl Iterator<Item = Category> {
        ALL_CATEGORIES.into_iter().filter(move |c| self.contains(*c))
    }
}

/// Pure mapping from error to category set. Stateless by design so the retry
/// engine and circuit breaker can both consult it without coordination.
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify `error`. Returns the empty set for the taxonomy rows that are
    /// never retried and never trip a breaker; some rows classify into more
    /// than one category (see the taxonomy table this mirrors).
    pub fn classify(error: &RequestError) -> Categories {
        match error {
            RequestError::Validation { .. } => Categories::none(),
            RequestError::ConnectTimeout { .. } => Categories::of(Category::Timeout).and(Category::Connection),
            RequestError::ReadTimeout { .. } => Categories::of(Category::Timeout),
            RequestError::Connection { .. } => Categories::of(Category::Connection).and(Category::Transient),
            RequestError::Protocol { .. } => Categories::none(),
            RequestError::Http { status, .. } => {
                if *status == 429 {
                    Categories::of(Category::RateLimit)
                } else if (500..600).contains(status) {
                    Categories::of(Category::Server).and(Category::Transient)
                } else {
                    Categories::none()
                }
            }
            RequestError::TooManyRedirects { .. } => Categories::none(),
            RequestError::CircuitOpen { .. } => Categories::none(),
            RequestError::PoolExhausted { .. } => Categories::of(Category::Transient),
            RequestError::NotProcessedByPeer { .. } => Categories::of(Category::Connection),
            RequestError::Cancelled { .. } => Categories::none(),
        }
    }

    /// The narrower subset of categories the circuit breaker is allowed to
    /// count as a failure observation (§4.7: classification errors like
    /// `ValidationError` never trip it, and `Connection` here also covers
    /// the `TRANSIENT`/`SERVER`/`TIMEOUT`/`CONNECTION` quartet named in the
    /// breaker contract).
    pub fn trips_breaker(categories: Categories) -> bool {
        categories.intersects(&[Category::Transient, Category::Server, Category::Connection, Category::Timeout])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RequestIdGenerator;

    fn id() -> crate::ids::RequestId {
        RequestIdGenerator::new().next_id()
    }

    #[test]
    fn validation_never_classifies() {
        assert!(ErrorClassifier::classify(&RequestError::validation("x")).is_empty());
    }

    #[test]
    fn rate_limit_status_maps_to_rate_limit_only() {
        let err = RequestError::http(id(), 429, "Too Many Requests");
        let categories = ErrorClassifier::classify(&err);
        assert!(categories.contains(Category::RateLimit));
        assert!(!categories.contains(Category::Server));
        assert!(!categories.contains(Category::Transient));
    }

    #[test]
    fn server_status_maps_to_server_and_transient() {
        let err = RequestError::http(id(), 503, "Service Unavailable");
        let categories = ErrorClassifier::classify(&err);
        assert!(categories.contains(Category::Server));
        assert!(categories.contains(Category::Transient));
    }

    #[test]
    fn client_status_does_not_classify() {
        let err = RequestError::http(id(), 404, "Not Found");
        assert!(ErrorClassifier::classify(&err).is_empty());
    }

    #[test]
    fn connect_timeout_maps_to_timeout_and_connection() {
        let err = RequestError::connect_timeout(id(), std::time::Duration::from_secs(1));
        let categories = ErrorClassifier::classify(&err);
        assert!(categories.contains(Category::Timeout));
        assert!(categories.contains(Category::Connection));
    }

    #[test]
    fn connection_error_maps_to_connection_and_transient() {
        let err = RequestError::connection(id(), "reset by peer");
        let categories = ErrorClassifier::classify(&err);
        assert!(categories.contains(Category::Connection));
        assert!(categories.contains(Category::Transient));
    }

    #[test]
    fn breaker_ignores_rate_limit_category() {
        assert!(!ErrorClassifier::trips_breaker(Categories::of(Category::RateLimit)));
        assert!(ErrorClassifier::trips_breaker(Categories::of(Category::Server)));
    }
}
