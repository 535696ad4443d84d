use std::time::Duration;

use meridian_http::breaker::{CircuitBreaker, CircuitBreakerConfig, Outcome, Scope};
use meridian_http::buffer::{BufferPool, BufferPoolConfig};
use meridian_http::hostkey::{HostKey, Scheme};

fn host() -> HostKey {
    HostKey::new(Scheme::Https, "example.com", 443)
}

#[test]
fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
    let config = CircuitBreakerConfig::new()
        .failure_threshold(3)
        .recovery_timeout(Duration::from_millis(10))
        .scope(Scope::PerHost);
    let breaker = CircuitBreaker::new(config);

    assert!(breaker.admit(Some(&host())));
    for _ in 0..3 {
        breaker.notify(Some(&host()), Outcome::Failure);
    }
    assert!(!breaker.admit(Some(&host())), "breaker should open after hitting the failure threshold");

    std::thread::sleep(Duration::from_millis(20));
    assert!(breaker.admit(Some(&host())), "breaker should allow a probe request once the cooldown elapses");
}

#[test]
fn breaker_recovers_on_success_in_half_open() {
    let config = CircuitBreakerConfig::new()
        .failure_threshold(1)
        .recovery_timeout(Duration::from_millis(5))
        .success_threshold(1)
        .scope(Scope::PerHost);
    let breaker = CircuitBreaker::new(config);

    breaker.notify(Some(&host()), Outcome::Failure);
    assert!(!breaker.admit(Some(&host())));

    std::thread::sleep(Duration::from_millis(10));
    assert!(breaker.admit(Some(&host())));
    breaker.notify(Some(&host()), Outcome::Success);
    assert!(breaker.admit(Some(&host())), "a success in half-open should close the breaker");
}

#[test]
fn buffer_pool_reuses_released_buffer_of_matching_tier() {
    let pool = BufferPool::new(BufferPoolConfig::new().with_max_buffers_per_tier(4));

    let first = pool.acquire(4 * 1024);
    drop(first);
    assert_eq!(pool.stats().tiers[0].idle, 1, "the released buffer should sit idle in its tier");

    let _second = pool.acquire(4 * 1024);
    assert_eq!(pool.stats().tiers[0].idle, 0, "acquire should hand back the idle buffer instead of allocating");
}

#[test]
fn buffer_pool_views_keep_buffer_alive_until_both_drop() {
    let pool = BufferPool::new(BufferPoolConfig::new());
    let buf = pool.acquire(4 * 1024);
    buf.extend_from_slice(b"hello");

    let view = buf.view();
    assert_eq!(view.ref_count(), 2);
    assert_eq!(&view.slice(0, 5)[..], b"hello");

    drop(buf);
    // The view still owns a reference into the data; reading through it
    // after the original handle drops must not panic or corrupt.
    assert_eq!(&view.slice(0, 5)[..], b"hello");
}
