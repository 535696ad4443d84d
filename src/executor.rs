//! RequestExecutor (§4.9): the end-to-end per-request algorithm tying the
//! breaker, pool, transports, and retry engine together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::breaker::{CircuitBreaker, Outcome};
use crate::classify::ErrorClassifier;
use crate::error::RequestError;
use crate::hostkey::HostKey;
use crate::ids::RequestId;
use crate::pool::{Acquired, ConnectionPool};
use crate::request::Request;
use crate::response::Response;
use crate::retry::{AttemptFailure, Decision, RetryEngine};
use crate::tracer::{ConnectionOrigin, MetricsSink, NoopMetricsSink, NoopTracer, Tracer};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub prefer_h2: bool,
    pub allow_new_connections: bool,
    /// Overall wall-clock deadline applied when a request carries no
    /// per-call timeout (§4.9: "a single wall-clock deadline governs the
    /// whole call").
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self {
            prefer_h2: true,
            allow_new_connections: true,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives one logical call (including retries) against the pool. One
/// instance is cheap to share: everything it owns is already `Arc`'d or
/// immutable.
pub struct RequestExecutor {
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryEngine,
    tracer: Arc<dyn Tracer>,
    metrics: Arc<dyn MetricsSink>,
    config: ExecutorConfig,
}

impl RequestExecutor {
    pub fn new(pool: Arc<ConnectionPool>, breaker: Arc<CircuitBreaker>, retry: RetryEngine, config: ExecutorConfig) -> Self {
        Self {
            pool,
            breaker,
            retry,
            tracer: Arc::new(NoopTracer),
            metrics: Arc::new(NoopMetricsSink),
            config,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run the §4.9 algorithm for `request`, retrying per the engine's
    /// decision until it gives up or the overall deadline elapses.
    pub async fn execute(&self, request: &Request, id: RequestId) -> Result<Response, RequestError> {
        // Step 1/2: validate + defaults. `Request::new` already validated
        // URL/headers/method at construction; deriving the host here is the
        // remaining piece of step 1 the executor itself must perform.
        let host = request.host_key()?;
        let overall_deadline = Instant::now() + request.timeout().unwrap_or(self.config.default_timeout);

        let mut attempt = 0u32;
        let mut prior_delay: Option<Duration> = None;

        loop {
            self.tracer.on_attempt_start(id, &host, attempt);
            self.metrics.record_attempt(&host);

            match self.try_once(request, &host, id, overall_deadline).await {
                Ok(response) => {
                    self.breaker.notify(Some(&host), Outcome::Success);
                    self.tracer.on_request_complete(id, &host, Some(response.status().as_u16()), response.elapsed());
                    self.metrics.record_latency(&host, response.elapsed());
                    return Ok(response);
                }
                Err(AttemptOutcome::CircuitOpen) => {
                    self.tracer.on_circuit_open(id, &host);
                    self.metrics.record_circuit_open(&host);
                    return Err(RequestError::circuit_open(id, host.to_string()));
                }
                Err(AttemptOutcome::DeadlineExceeded) => {
                    return Err(RequestError::cancelled(id));
                }
                Err(AttemptOutcome::Failed { error, provably_pre_processing }) => {
                    let category = ErrorClassifier::classify(&error);
                    self.breaker.notify(Some(&host), Outcome::from_category(category));
                    self.tracer.on_attempt_failure(id, &host, category);

                    let failure = AttemptFailure {
                        error: &error,
                        provably_pre_processing,
                        retry_after: None,
                    };
                    let decision = self.retry.decide(
                        &host,
                        attempt,
                        prior_delay,
                        &failure,
                        request.is_idempotent(),
                        request.body().is_resendable(),
                    );
                    match decision {
                        Decision::GiveUp => return Err(error),
                        Decision::Retry { delay } => {
                            let remaining = overall_deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() || delay > remaining {
                                return Err(error);
                            }
                            self.tracer.on_retry_scheduled(id, &host, attempt, delay);
                            self.metrics.record_retry(&host);
                            tokio::time::sleep(delay).await;
                            // Resending a streamed body needs it reset to the
                            // start; `is_resendable()` above already gated on
                            // `can_rewind()`, so this is always safe to call.
                            request.body().rewind_for_retry();
                            prior_delay = Some(delay);
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    /// One attempt: breaker check, acquire, hand off to transport. Never
    /// retries itself — the caller's loop owns retry bookkeeping.
    async fn try_once(
        &self,
        request: &Request,
        host: &HostKey,
        id: RequestId,
        overall_deadline: Instant,
    ) -> Result<Response, AttemptOutcome> {
        // Step 3: consult the breaker before touching the pool at all.
        if !self.breaker.admit(Some(host)) {
            return Err(AttemptOutcome::CircuitOpen);
        }

        let remaining = overall_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AttemptOutcome::DeadlineExceeded);
        }

        // Step 4: acquire a connection, respecting the remaining deadline.
        let acquire = self.pool.acquire(host, self.config.allow_new_connections, self.config.prefer_h2, id);
        let acquired = match tokio::time::timeout(remaining, acquire).await {
            Ok(Ok(acquired)) => acquired,
            Ok(Err(error)) => {
                // Never reached the wire: safe to retry even for a
                // non-idempotent request (§4.8 condition 3).
                return Err(AttemptOutcome::Failed { error, provably_pre_processing: true });
            }
            Err(_) => return Err(AttemptOutcome::DeadlineExceeded),
        };

        let origin = match &acquired {
            Acquired::H1(conn) if conn.meta().request_count() > 0 => ConnectionOrigin::Reused,
            Acquired::H2(conn) if conn.meta().request_count() > 0 => ConnectionOrigin::Reused,
            _ => ConnectionOrigin::New,
        };
        self.tracer.on_connection_acquired(id, host, origin);

        let remaining = overall_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AttemptOutcome::DeadlineExceeded);
        }

        // Step 5/6: hand off to transport within the remaining deadline.
        match acquired {
            Acquired::H1(mut conn) => {
                let result = tokio::time::timeout(remaining, conn.send_request(request, id)).await;
                match result {
                    Ok(Ok(response)) => {
                        self.pool.release_h1(host, conn).await;
                        Ok(response)
                    }
                    Ok(Err(error)) => {
                        // `send_request` already marked the connection
                        // Broken on failure; releasing destroys it rather
                        // than returning it to idle (see `HostPool::release_h1`).
                        self.pool.release_h1(host, conn).await;
                        Err(AttemptOutcome::Failed { error, provably_pre_processing: false })
                    }
                    Err(_) => {
                        conn.meta().set_state(crate::connection::ConnectionState::Broken);
                        self.pool.release_h1(host, conn).await;
                        Err(AttemptOutcome::DeadlineExceeded)
                    }
                }
            }
            Acquired::H2(conn) => {
                let result = tokio::time::timeout(remaining, conn.send_request(request, id)).await;
                match result {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(error)) => {
                        let provably_pre_processing = matches!(&error, RequestError::NotProcessedByPeer { .. });
                        if conn.meta().state().is_terminal() {
                            self.pool.drop_h2(host, &conn).await;
                        }
                        Err(AttemptOutcome::Failed { error, provably_pre_processing })
                    }
                    Err(_) => Err(AttemptOutcome::DeadlineExceeded),
                }
            }
        }
    }
}

enum AttemptOutcome {
    CircuitOpen,
    DeadlineExceeded,
    Failed { error: RequestError, provably_pre_processing: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::buffer::{BufferPool, BufferPoolConfig};
    use crate::connection::h1::{AsyncIo, H1Connection};
    use crate::connection::{Connection, Protocol};
    use crate::hostkey::Scheme;
    use crate::ids::ConnectionIdGenerator;
    use crate::pool::{ConnectionPoolConfig, QueueConnector};
    use crate::pool::NewConnection;
    use crate::retry::RetryPolicy;
    use crate::backoff::ExponentialBackoff;
    use crate::request::Body;
    use http::Method;

    fn setup(responses: Vec<NewConnection>) -> (Arc<ConnectionPool>, Arc<CircuitBreaker>) {
        let connector = QueueConnector::new(responses);
        let buffer_pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        let pool = ConnectionPool::new(ConnectionPoolConfig::new(), connector, buffer_pool);
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::new());
        (pool, breaker)
    }

    fn fresh_h1_conn(ids: &ConnectionIdGenerator) -> (tokio::io::DuplexStream, crate::pool::BoxedH1) {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let meta = Arc::new(Connection::new(
            ids.next_id(),
            HostKey::new(Scheme::Https, "example.com", 443),
            Protocol::H1,
            "127.0.0.1:443".parse().unwrap(),
        ));
        let pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        (server_side, H1Connection::new(meta, Box::new(client_side) as Box<dyn AsyncIo>, pool))
    }

    #[tokio::test]
    async fn successful_get_returns_response() {
        let ids = ConnectionIdGenerator::new();
        let (mut server, conn) = fresh_h1_conn(&ids);
        let (pool, breaker) = setup(vec![NewConnection::H1(conn)]);
        let retry = RetryEngine::new(
            RetryPolicy::new(),
            Box::new(ExponentialBackoff::new(Duration::from_millis(1), 2.0, Duration::from_secs(1), false)),
            Arc::clone(&breaker),
        );
        let executor = RequestExecutor::new(pool, breaker, retry, ExecutorConfig::new());

        let request = Request::new(Method::GET, "https://example.com/widgets".parse().unwrap(), http::HeaderMap::new(), Body::empty()).unwrap();
        let id = RequestId::default_for_test();

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
        });

        let response = executor.execute(&request, id).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_acquiring() {
        let (pool, breaker) = setup(vec![]);
        for _ in 0..CircuitBreakerConfig::new().failure_threshold {
            breaker.notify(Some(&HostKey::new(Scheme::Https, "example.com", 443)), Outcome::Failure);
        }
        let retry = RetryEngine::new(
            RetryPolicy::new(),
            Box::new(ExponentialBackoff::new(Duration::from_millis(1), 2.0, Duration::from_secs(1), false)),
            Arc::clone(&breaker),
        );
        let executor = RequestExecutor::new(pool, breaker, retry, ExecutorConfig::new());
        let request = Request::new(Method::GET, "https://example.com/widgets".parse().unwrap(), http::HeaderMap::new(), Body::empty()).unwrap();
        let id = RequestId::default_for_test();

        let err = executor.execute(&request, id).await.unwrap_err();
        assert!(matches!(err, RequestError::CircuitOpen { .. }));
    }
}
