//! RetryEngine (§4.8): decides whether a failed attempt may be repeated, and
//! after how long.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffStrategy;
use crate::breaker::CircuitBreaker;
use crate::classify::{Category, ErrorClassifier};
use crate::error::RequestError;
use crate::hostkey::HostKey;
use crate::response::Response;

/// Static policy knobs. The dynamic pieces — breaker consultation, backoff
/// delay math — live on [`RetryEngine`] itself.
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_categories: HashSet<Category>,
    pub status_force_list: HashSet<u16>,
    pub respect_retry_after: bool,
    /// Caller-supplied predicate over a successful-but-unacceptable
    /// response (e.g. a 200 carrying an application-level error body).
    pub retry_if_result: Option<Arc<dyn Fn(&Response) -> bool + Send + Sync>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            retry_categories: [Category::Transient, Category::Server, Category::Connection, Category::Timeout]
                .into_iter()
                .collect(),
            status_force_list: HashSet::new(),
            respect_retry_after: true,
            retry_if_result: None,
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn status_force_list(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.status_force_list = statuses.into_iter().collect();
        self
    }

    pub fn retry_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.retry_categories = categories.into_iter().collect();
        self
    }

    pub fn respect_retry_after(mut self, yes: bool) -> Self {
        self.respect_retry_after = yes;
        self
    }

    pub fn retry_if_result(mut self, predicate: impl Fn(&Response) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if_result = Some(Arc::new(predicate));
        self
    }
}

/// What the executor observed at the end of an attempt, enough to let the
/// engine apply §4.8's four conditions.
pub struct AttemptFailure<'a> {
    pub error: &'a RequestError,
    /// `true` when the failure is provably pre-processing per §4.8 condition
    /// 3: a connect failure, or an H2 stream id known to be above the
    /// peer's GOAWAY `last_processed_stream_id`.
    pub provably_pre_processing: bool,
    /// Seconds to wait before retrying, parsed from a `Retry-After` header
    /// when the failure carried an HTTP response (e.g. 429/503).
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    GiveUp,
}

/// Consults the breaker, classifies the failure, and applies §4.8's retry
/// predicate — conditions 1 through 4, each ANDed, with condition 2 being an
/// OR of category/status/predicate matches.
pub struct RetryEngine {
    policy: RetryPolicy,
    backoff: Box<dyn BackoffStrategy>,
    breaker: Arc<CircuitBreaker>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, backoff: Box<dyn BackoffStrategy>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { policy, backoff, breaker }
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Evaluate whether `failure` on `attempt` (0-based) against `host`
    /// should be retried, and if so after what delay.
    ///
    /// `is_idempotent` and `body_resendable` gate condition 3 together: a
    /// non-idempotent request with a non-restartable body is only eligible
    /// via `failure.provably_pre_processing`.
    pub fn decide(
        &self,
        host: &HostKey,
        attempt: u32,
        prior_delay: Option<Duration>,
        failure: &AttemptFailure<'_>,
        is_idempotent: bool,
        body_resendable: bool,
    ) -> Decision {
        if attempt >= self.policy.max_retries {
            return Decision::GiveUp;
        }

        let categories = ErrorClassifier::classify(failure.error);
        let status_forced = matches!(failure.error, RequestError::Http { status, .. } if self.policy.status_force_list.contains(status));
        let category_eligible = categories.iter().any(|c| self.policy.retry_categories.contains(&c));
        if !category_eligible && !status_forced {
            return Decision::GiveUp;
        }

        let safe_to_resend = (is_idempotent && body_resendable) || failure.provably_pre_processing;
        if !safe_to_resend {
            return Decision::GiveUp;
        }

        if !self.breaker.admit(Some(host)) {
            return Decision::GiveUp;
        }

        let base_delay = self.backoff.next_delay(attempt, prior_delay);
        let delay = match (self.policy.respect_retry_after, failure.retry_after) {
            (true, Some(retry_after)) => base_delay.max(retry_after),
            _ => base_delay,
        };
        Decision::Retry { delay }
    }

    /// Variant of [`RetryEngine::decide`] for a structurally successful
    /// response that the caller's `retry_if_result` predicate still rejects
    /// (condition 2's third clause). Idempotency/body gating and breaker
    /// consultation apply identically.
    pub fn decide_for_response(
        &self,
        host: &HostKey,
        attempt: u32,
        prior_delay: Option<Duration>,
        response: &Response,
        is_idempotent: bool,
        body_resendable: bool,
    ) -> Decision {
        if attempt >= self.policy.max_retries {
            return Decision::GiveUp;
        }
        let matched = self.policy.retry_if_result.as_ref().is_some_and(|pred| pred(response));
        if !matched {
            return Decision::GiveUp;
        }
        if !((is_idempotent && body_resendable)) {
            return Decision::GiveUp;
        }
        if !self.breaker.admit(Some(host)) {
            return Decision::GiveUp;
        }
        Decision::Retry {
            delay: self.backoff.next_delay(attempt, prior_delay),
        }
    }
}

/// Parse a `Retry-After` header value: either a delta-seconds integer or an
/// HTTP-date. Unparseable or past-dated values are ignored (`None`).
pub fn parse_retry_after(value: &str, now: std::time::SystemTime) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value.trim()).ok()?;
    when.duration_since(now).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::breaker::CircuitBreakerConfig;
    use crate::hostkey::Scheme;
    use crate::ids::RequestIdGenerator;

    fn host() -> HostKey {
        HostKey::new(Scheme::Https, "example.com", 443)
    }

    fn engine(policy: RetryPolicy) -> RetryEngine {
        let backoff = Box::new(ExponentialBackoff::new(
            Duration::from_millis(10),
            2.0,
            Duration::from_secs(1),
            false,
        ));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::new());
        RetryEngine::new(policy, backoff, breaker)
    }

    #[test]
    fn retries_idempotent_transient_failure() {
        let id = RequestIdGenerator::new().next_id();
        let engine = engine(RetryPolicy::new());
        let err = RequestError::connection(id, "reset by peer");
        let failure = AttemptFailure {
            error: &err,
            provably_pre_processing: false,
            retry_after: None,
        };
        let decision = engine.decide(&host(), 0, None, &failure, true, true);
        assert!(matches!(decision, Decision::Retry { .. }));
    }

    #[test]
    fn refuses_non_idempotent_unless_pre_processing() {
        let id = RequestIdGenerator::new().next_id();
        let engine = engine(RetryPolicy::new());
        let err = RequestError::connection(id, "reset by peer");
        let failure = AttemptFailure {
            error: &err,
            provably_pre_processing: false,
            retry_after: None,
        };
        assert_eq!(engine.decide(&host(), 0, None, &failure, false, false), Decision::GiveUp);

        let failure_pre = AttemptFailure {
            error: &err,
            provably_pre_processing: true,
            retry_after: None,
        };
        assert!(matches!(engine.decide(&host(), 0, None, &failure_pre, false, false), Decision::Retry { .. }));
    }

    #[test]
    fn validation_errors_never_retry() {
        let engine = engine(RetryPolicy::new());
        let err = RequestError::validation("bad header");
        let failure = AttemptFailure {
            error: &err,
            provably_pre_processing: false,
            retry_after: None,
        };
        assert_eq!(engine.decide(&host(), 0, None, &failure, true, true), Decision::GiveUp);
    }

    #[test]
    fn status_force_list_overrides_category() {
        let id = RequestIdGenerator::new().next_id();
        let policy = RetryPolicy::new().status_force_list([404]);
        let engine = engine(policy);
        let err = RequestError::http(id, 404, "Not Found");
        let failure = AttemptFailure {
            error: &err,
            provably_pre_processing: false,
            retry_after: None,
        };
        assert!(matches!(engine.decide(&host(), 0, None, &failure, true, true), Decision::Retry { .. }));
    }

    #[test]
    fn exhausting_max_retries_gives_up() {
        let id = RequestIdGenerator::new().next_id();
        let engine = engine(RetryPolicy::new().max_retries(1));
        let err = RequestError::connection(id, "reset by peer");
        let failure = AttemptFailure {
            error: &err,
            provably_pre_processing: false,
            retry_after: None,
        };
        assert_eq!(engine.decide(&host(), 1, None, &failure, true, true), Decision::GiveUp);
    }

    #[test]
    fn retry_after_overrides_backoff_delay() {
        let id = RequestIdGenerator::new().next_id();
        let engine = engine(RetryPolicy::new());
        let err = RequestError::connection(id, "reset by peer");
        let failure = AttemptFailure {
            error: &err,
            provably_pre_processing: false,
            retry_after: Some(Duration::from_secs(5)),
        };
        let Decision::Retry { delay } = engine.decide(&host(), 0, None, &failure, true, true) else {
            panic!("expected retry")
        };
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn parses_delta_seconds_retry_after() {
        let now = std::time::SystemTime::now();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
    }
}
