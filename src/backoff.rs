//! Backoff strategies: pure functions from attempt number to delay.
//!
//! Both strategies are deterministic given a seeded random source (a
//! `seed_hook` exists purely for tests): same attempt number and same
//! random draws always produce the same delay.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of randomness for jitter. Production code uses [`SystemRandom`];
/// tests use a seeded RNG so delay sequences are reproducible.
pub trait RandomSource: Send + Sync {
    /// A uniform sample in `[low, high)`.
    fn uniform(&self, low: f64, high: f64) -> f64;
}

/// Thread-local `rand::thread_rng`-backed source used by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn uniform(&self, low: f64, high: f64) -> f64 {
        rand::thread_rng().gen_range(low..high)
    }
}

/// Deterministic source seeded for reproducible tests.
pub struct SeededRandom {
    rng: std::sync::Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: std::sync::Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn uniform(&self, low: f64, high: f64) -> f64 {
        self.rng.lock().expect("rng poisoned").gen_range(low..high)
    }
}

/// A backoff strategy: `next_delay(attempt, prior_delay) -> Duration`.
pub trait BackoffStrategy: Send + Sync {
    fn next_delay(&self, attempt: u32, prior_delay: Option<Duration>) -> Duration;
}

/// `delay(n) = min(initial * multiplier^n, max_backoff)`, optionally jittered
/// by a uniform `(0.5, 1.5)` multiplier.
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_backoff: Duration,
    jitter: bool,
    random: Box<dyn RandomSource>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max_backoff: Duration, jitter: bool) -> Self {
        Self {
            initial,
            multiplier,
            max_backoff,
            jitter,
            random: Box::new(SystemRandom),
        }
    }

    /// Test/debug hook: swap in a deterministic random source.
    pub fn with_random_source(mut self, source: Box<dyn RandomSource>) -> Self {
        self.random = source;
        self
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, _prior_delay: Option<Duration>) -> Duration {
        let raw = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        let scaled = if self.jitter {
            capped * self.random.uniform(0.5, 1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// `delay(0) = base`; `delay(n) = min(uniform(base, prior_delay * 3), max_backoff)`.
pub struct DecorrelatedJitterBackoff {
    base: Duration,
    max_backoff: Duration,
    random: Box<dyn RandomSource>,
}

impl DecorrelatedJitterBackoff {
    pub fn new(base: Duration, max_backoff: Duration) -> Self {
        Self {
            base,
            max_backoff,
            random: Box::new(SystemRandom),
        }
    }

    pub fn with_random_source(mut self, source: Box<dyn RandomSource>) -> Self {
        self.random = source;
        self
    }
}

impl BackoffStrategy for DecorrelatedJitterBackoff {
    fn next_delay(&self, attempt: u32, prior_delay: Option<Duration>) -> Duration {
        if attempt == 0 || prior_delay.is_none() {
            return self.base;
        }
        let prior = prior_delay.unwrap().as_secs_f64();
        let base = self.base.as_secs_f64();
        let high = (prior * 3.0).max(base + f64::EPSILON);
        let sampled = self.random.uniform(base, high);
        Duration::from_secs_f64(sampled.min(self.max_backoff.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_caps_at_max() {
        let strategy = ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            false,
        );
        assert_eq!(strategy.next_delay(0, None), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(1, None), Duration::from_millis(200));
        assert_eq!(strategy.next_delay(10, None), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_jitter_stays_in_bounds() {
        let strategy = ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            true,
        )
        .with_random_source(Box::new(SeededRandom::new(42)));
        for attempt in 0..8 {
            let raw = 0.1 * 2f64.powi(attempt as i32);
            let capped = raw.min(10.0);
            let delay = strategy.next_delay(attempt, None).as_secs_f64();
            assert!(delay >= capped * 0.5 - 1e-9, "delay {delay} below lower bound");
            assert!(delay <= capped * 1.5 + 1e-9, "delay {delay} above upper bound");
        }
    }

    #[test]
    fn decorrelated_jitter_first_delay_is_base() {
        let strategy = DecorrelatedJitterBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(strategy.next_delay(0, None), Duration::from_millis(100));
    }

    #[test]
    fn decorrelated_jitter_stays_within_bounds_and_caps() {
        let strategy = DecorrelatedJitterBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_random_source(Box::new(SeededRandom::new(7)));
        let mut prior = Duration::from_millis(100);
        for attempt in 1..6 {
            let delay = strategy.next_delay(attempt, Some(prior));
            assert!(delay.as_secs_f64() >= 0.1 - 1e-9);
            assert!(delay <= Duration::from_secs(10));
            prior = delay;
        }
    }

    #[test]
    fn backoff_is_deterministic_given_a_seed() {
        let a = ExponentialBackoff::new(Duration::from_millis(50), 2.0, Duration::from_secs(5), true)
            .with_random_source(Box::new(SeededRandom::new(99)));
        let b = ExponentialBackoff::new(Duration::from_millis(50), 2.0, Duration::from_secs(5), true)
            .with_random_source(Box::new(SeededRandom::new(99)));
        for attempt in 0..5 {
            assert_eq!(a.next_delay(attempt, None), b.next_delay(attempt, None));
        }
    }
}
