//! Rate limiters deciding how long a failed key waits before its next attempt.
//!
//! A limiter is asked [`when`](RateLimiter::when) each time a key is requeued
//! after a failure. Per-key limiters keep a failure count that grows the delay
//! until [`forget`](RateLimiter::forget) resets it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::retry::RetryConfig;

/// Decides the requeue delay for keys.
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure for `key` and return how long it should wait.
    fn when(&self, key: &K) -> Duration;

    /// Clear the failure history of `key`.
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential backoff.
///
/// The n-th failure of a key (0-indexed) waits
/// `min(max_delay, initial_delay * multiplier^n)`.
#[derive(Debug)]
pub struct ExponentialFailureRateLimiter<K> {
    config: RetryConfig,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash,
{
    /// Create a limiter using the delays of `config`.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Get the number of keys with a failure history.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        lock(&self.failures).len()
    }
}

impl<K> RateLimiter<K> for ExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        self.config.delay_for_attempt(attempt)
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub qps: f64,
    /// Maximum number of tokens in the bucket.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            qps: 10.0,
            burst: 100,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys.
///
/// Each call to [`when`](RateLimiter::when) reserves one token; once the
/// bucket is empty the returned delay is the time until that token refills.
/// A non-positive or non-finite `qps` disables limiting.
#[derive(Debug)]
pub struct BucketRateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a full bucket.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = f64::from(config.burst);
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens,
                last: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let qps = self.config.qps;
        if !(qps.is_finite() && qps > 0.0) {
            return Duration::ZERO;
        }

        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed.mul_add(qps, bucket.tokens).min(f64::from(self.config.burst));
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Create a limiter that consults every member on each call.
    #[must_use]
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff bounded by an overall token bucket.
#[must_use]
pub fn default_controller_rate_limiter<K>(
    retry: &RetryConfig,
    bucket: &RateLimitConfig,
) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    let limiters: Vec<Arc<dyn RateLimiter<K>>> = vec![
        Arc::new(ExponentialFailureRateLimiter::new(retry.clone())),
        Arc::new(BucketRateLimiter::new(bucket.clone())),
    ];
    MaxOfRateLimiter::new(limiters)
}
