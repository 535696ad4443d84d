use std::time::{Duration, Instant};

/// The breaker's per-key state machine: closed/open/half-open per §4.7.
#[derive(Debug, Clone, Copy)]
pub enum CircuitState {
    Closed {
        failures: u32,
        window_start: Instant,
    },
    Open {
        opened_at: Instant,
    },
    HalfClosed {
        probes_remaining: u32,
        successes: u32,
    },
}

impl CircuitState {
    pub fn closed_now() -> Self {
        CircuitState::Closed {
            failures: 0,
            window_start: Instant::now(),
        }
    }

    /// Whether a request should be let through right now, given `recovery_timeout`.
    /// Transitions `Open -> HalfClosed` in place when the recovery timeout has
    /// elapsed.
    pub fn admit(&mut self, recovery_timeout: Duration, success_threshold: u32) -> bool {
        match *self {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= recovery_timeout {
                    *self = CircuitState::HalfClosed {
                        probes_remaining: success_threshold,
                        successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfClosed {
                ref mut probes_remaining,
                ..
            } => {
                if *probes_remaining > 0 {
                    *probes_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a success observation.
    pub fn on_success(&mut self, success_threshold: u32) {
        match *self {
            CircuitState::Closed { .. } => {}
            CircuitState::Open { .. } => {
                // A success can only be observed here if admit() already
                // flipped us to HalfClosed; treat defensively as a probe pass.
                *self = CircuitState::HalfClosed {
                    probes_remaining: success_threshold.saturating_sub(1),
                    successes: 1,
                };
            }
            CircuitState::HalfClosed {
                ref mut successes, ..
            } => {
                *successes += 1;
                if *successes >= success_threshold {
                    *self = CircuitState::closed_now();
                }
            }
        }
    }

    /// Record a failure observation.
    pub fn on_failure(&mut self, window: Duration, failure_threshold: u32) {
        match *self {
            CircuitState::Closed {
                ref mut failures,
                ref mut window_start,
            } => {
                if window_start.elapsed() > window {
                    *failures = 0;
                    *window_start = Instant::now();
                }
                *failures += 1;
                if *failures >= failure_threshold {
                    *self = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            CircuitState::Open { .. } => {
                // Already open; re-arm the timer (no-op, stays open).
            }
            CircuitState::HalfClosed { .. } => {
                *self = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_trips_open_at_threshold() {
        let mut s = CircuitState::closed_now();
        for _ in 0..2 {
            s.on_failure(Duration::from_secs(60), 3);
            assert!(!s.is_open());
        }
        s.on_failure(Duration::from_secs(60), 3);
        assert!(s.is_open());
    }

    #[test]
    fn open_rejects_until_recovery_timeout() {
        let mut s = CircuitState::Open {
            opened_at: Instant::now(),
        };
        assert!(!s.admit(Duration::from_secs(3600), 1));
    }

    #[test]
    fn half_closed_closes_after_success_threshold() {
        let mut s = CircuitState::HalfClosed {
            probes_remaining: 2,
            successes: 0,
        };
        s.on_success(2);
        assert!(!matches!(s, CircuitState::Closed { .. }));
        s.on_success(2);
        assert!(matches!(s, CircuitState::Closed { .. }));
    }

    #[test]
    fn half_closed_failure_reopens() {
        let mut s = CircuitState::HalfClosed {
            probes_remaining: 2,
            successes: 1,
        };
        s.on_failure(Duration::from_secs(60), 3);
        assert!(s.is_open());
    }
}
