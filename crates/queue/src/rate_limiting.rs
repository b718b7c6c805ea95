//! Delaying queue with rate-limited requeues.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::delaying::DelayingQueue;
use crate::rate_limit::RateLimiter;

/// [`DelayingQueue`] whose failed keys are requeued after a delay chosen by a
/// [`RateLimiter`].
pub struct RateLimitingQueue<K> {
    queue: DelayingQueue<K>,
    limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            queue: DelayingQueue::new(),
            limiter,
        }
    }

    /// Requeue `key` after the delay its failure history calls for.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        self.queue.add_after(key, delay);
    }

    /// Clear the failure history of `key`. Queue membership is unaffected.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// See [`DelayingQueue::add`].
    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    /// See [`DelayingQueue::add_after`].
    pub fn add_after(&self, key: K, delay: Duration) {
        self.queue.add_after(key, delay);
    }

    /// See [`DelayingQueue::get`].
    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    /// See [`DelayingQueue::done`].
    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    /// See [`DelayingQueue::len`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`DelayingQueue::is_empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// See [`DelayingQueue::delayed_len`].
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.queue.delayed_len()
    }

    /// See [`DelayingQueue::shut_down`].
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    /// See [`DelayingQueue::is_shutting_down`].
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::rate_limit::ExponentialFailureRateLimiter;
    use crate::retry::RetryConfig;

    fn queue() -> RateLimitingQueue<&'static str> {
        RateLimitingQueue::new(Arc::new(ExponentialFailureRateLimiter::new(RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            ..Default::default()
        })))
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delays_grow() {
        let queue = queue();
        queue.add("ns/c");

        let mut observed = Vec::new();
        for _ in 0..5 {
            let key = queue.get().await.unwrap();
            queue.add_rate_limited(key);
            queue.done(&key);

            let start = Instant::now();
            assert_eq!(queue.get().await, Some("ns/c"));
            observed.push(start.elapsed().as_secs());
            queue.done(&"ns/c");
            queue.add("ns/c");
        }

        assert_eq!(observed, vec![1, 2, 4, 8, 8]);
        assert_eq!(queue.num_requeues(&"ns/c"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_keeps_membership() {
        let queue = queue();
        queue.add("ns/a");
        queue.add_rate_limited("ns/a");
        queue.forget(&"ns/a");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_requeues(&"ns/a"), 0);
    }
}
