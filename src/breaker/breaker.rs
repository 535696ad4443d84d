use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::hostkey::HostKey;

use super::state::CircuitState;

/// Whether a breaker instance gates all traffic with one state machine, or
/// keeps one per [`HostKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    PerHost,
}

/// Configuration for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub window: Duration,
    pub scope: Scope,
    pub max_hosts: usize,
    /// How often the background sweep checks per-host entry count against
    /// `max_hosts` and evicts the least-recently-touched ones.
    pub sweep_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            window: Duration::from_secs(60),
            scope: Scope::PerHost,
            max_hosts: 1024,
            sweep_interval: Duration::from_secs(30),
        }
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn recovery_timeout(mut self, d: Duration) -> Self {
        self.recovery_timeout = d;
        self
    }

    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn window(mut self, d: Duration) -> Self {
        self.window = d;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn max_hosts(mut self, n: usize) -> Self {
        self.max_hosts = n;
        self
    }
}

/// Outcome of an attempt, as reported to the breaker after a response or
/// failure. Only the categories in `ErrorClassifier::trips_breaker` should
/// ever be reported as `Failure`; everything else (including successful
/// responses and non-tripping errors like `ValidationError`) is `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_category(categories: crate::classify::Categories) -> Self {
        if crate::classify::ErrorClassifier::trips_breaker(categories) {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }
}

struct HostEntry {
    state: Mutex<CircuitState>,
    last_touched: Mutex<Instant>,
}

impl HostEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(CircuitState::closed_now()),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_touched.lock().expect("breaker poisoned") = Instant::now();
    }
}

/// Admission gate consulted before connection acquisition (§4.7). Global
/// scope holds one state machine; per-host scope holds one per [`HostKey`]
/// in a `DashMap`, bounded by `max_hosts` with LRU eviction swept by a
/// background task, the same shape as a `CorrelationManager` cleanup loop.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    global: Mutex<CircuitState>,
    per_host: Arc<DashMap<HostKey, Arc<HostEntry>>>,
    shutdown: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        let breaker = Arc::new(Self {
            global: Mutex::new(CircuitState::closed_now()),
            per_host: Arc::new(DashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
            config,
        });

        if breaker.config.scope == Scope::PerHost {
            let handle = breaker.clone().spawn_sweeper();
            *breaker.sweeper.lock().expect("breaker poisoned") = Some(handle);
        }

        breaker
    }

    fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            loop {
                interval.tick().await;
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.evict_lru_over_cap();
            }
        })
    }

    fn evict_lru_over_cap(&self) {
        if self.per_host.len() <= self.config.max_hosts {
            return;
        }
        let mut oldest: Option<(HostKey, Instant)> = None;
        for entry in self.per_host.iter() {
            let touched = *entry.value().last_touched.lock().expect("breaker poisoned");
            if oldest.as_ref().map_or(true, |(_, t)| touched < *t) {
                oldest = Some((entry.key().clone(), touched));
            }
        }
        if let Some((key, _)) = oldest {
            self.per_host.remove(&key);
            trace!(host = %key, "evicted circuit breaker entry (max_hosts exceeded)");
        }
    }

    /// Consult the breaker before acquiring a connection. `host` is ignored
    /// in `Scope::Global` mode.
    pub fn admit(&self, host: Option<&HostKey>) -> bool {
        match self.config.scope {
            Scope::Global => self
                .global
                .lock()
                .expect("breaker poisoned")
                .admit(self.config.recovery_timeout, self.config.success_threshold),
            Scope::PerHost => {
                let Some(host) = host else {
                    return true;
                };
                let entry = self
                    .per_host
                    .entry(host.clone())
                    .or_insert_with(|| Arc::new(HostEntry::new()))
                    .clone();
                entry.touch();
                entry
                    .state
                    .lock()
                    .expect("breaker poisoned")
                    .admit(self.config.recovery_timeout, self.config.success_threshold)
            }
        }
    }

    /// Notify the breaker of an attempt's outcome, after the response (or
    /// failure) is known.
    pub fn notify(&self, host: Option<&HostKey>, outcome: Outcome) {
        match self.config.scope {
            Scope::Global => {
                let mut state = self.global.lock().expect("breaker poisoned");
                match outcome {
                    Outcome::Success => state.on_success(self.config.success_threshold),
                    Outcome::Failure => {
                        state.on_failure(self.config.window, self.config.failure_threshold)
                    }
                }
            }
            Scope::PerHost => {
                let Some(host) = host else { return };
                let entry = self
                    .per_host
                    .entry(host.clone())
                    .or_insert_with(|| Arc::new(HostEntry::new()))
                    .clone();
                entry.touch();
                let mut state = entry.state.lock().expect("breaker poisoned");
                match outcome {
                    Outcome::Success => state.on_success(self.config.success_threshold),
                    Outcome::Failure => {
                        state.on_failure(self.config.window, self.config.failure_threshold)
                    }
                }
                if outcome == Outcome::Failure && state.is_open() {
                    debug!(host = %host, "circuit opened");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().expect("breaker poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> HostKey {
        HostKey::new(crate::hostkey::Scheme::Https, "example.com", 443)
    }

    #[tokio::test]
    async fn per_host_opens_after_threshold_and_blocks_others_independently() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .failure_threshold(3)
                .recovery_timeout(Duration::from_secs(3600)),
        );
        let a = key();
        let b = HostKey::new(crate::hostkey::Scheme::Https, "other.com", 443);

        for _ in 0..3 {
            assert!(breaker.admit(Some(&a)));
            breaker.notify(Some(&a), Outcome::Failure);
        }
        assert!(!breaker.admit(Some(&a)), "breaker should be open for `a`");
        assert!(breaker.admit(Some(&b)), "breaker for `b` is unaffected");
    }

    #[tokio::test]
    async fn half_closed_probe_then_close_on_success() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_millis(1))
                .success_threshold(1),
        );
        let k = key();
        assert!(breaker.admit(Some(&k)));
        breaker.notify(Some(&k), Outcome::Failure);
        assert!(!breaker.admit(Some(&k)));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.admit(Some(&k)), "should allow a probe after recovery_timeout");
        breaker.notify(Some(&k), Outcome::Success);
        assert!(breaker.admit(Some(&k)), "should be closed again");
    }

    #[tokio::test]
    async fn global_scope_ignores_host() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .scope(Scope::Global)
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(3600)),
        );
        breaker.notify(None, Outcome::Failure);
        assert!(!breaker.admit(Some(&key())));
    }
}
