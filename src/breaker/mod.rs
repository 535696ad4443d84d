//! Circuit breaker: a closed/open/half-open admission gate, global or
//! per-host.
//!
//! Shaped like a `CorrelationManager`: a `DashMap` keyed table guarded
//! from unbounded growth, with a background `tokio::task` sweeping stale
//! entries on an interval and a shutdown flag joined on drop.

mod breaker;
mod state;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, Outcome, Scope};
pub use state::CircuitState;
