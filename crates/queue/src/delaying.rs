//! Work queue with delayed re-adds.
//!
//! Delayed keys are parked in a min-heap owned by a background waiting loop.
//! When a key's ready time passes the loop hands it to [`WorkQueue::add`], so
//! the usual coalescing and processing rules decide whether it becomes
//! visible to workers.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use crate::work_queue::WorkQueue;

// Roughly 30 years; used when a requested delay overflows `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A key parked until `ready_at`.
#[derive(Debug)]
struct WaitFor<K> {
    key: K,
    ready_at: Instant,
    seq: u64,
}

impl<K> PartialEq for WaitFor<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for WaitFor<K> {}

impl<K> PartialOrd for WaitFor<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for WaitFor<K> {
    // Reversed so the max-heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Waiting<K> {
    heap: BinaryHeap<WaitFor<K>>,
    // Current ready time per key. Heap entries that disagree are stale.
    ready_at: HashMap<K, Instant>,
    next_seq: u64,
}

impl<K> Waiting<K>
where
    K: Clone + Eq + Hash,
{
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            ready_at: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Park `key` until `ready_at`. Returns `false` if it was already parked
    /// for an earlier or equal time.
    fn insert(&mut self, key: K, ready_at: Instant) -> bool {
        match self.ready_at.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= ready_at {
                    return false;
                }
                entry.insert(ready_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(ready_at);
            }
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(WaitFor { key, ready_at, seq });
        true
    }

    /// Remove every key whose ready time is at or before `now`.
    fn pop_ready(&mut self, now: Instant) -> Vec<K> {
        let mut ready = Vec::new();
        while self.heap.peek().is_some_and(|next| next.ready_at <= now) {
            let Some(entry) = self.heap.pop() else { break };
            if self.ready_at.get(&entry.key) == Some(&entry.ready_at) {
                self.ready_at.remove(&entry.key);
                ready.push(entry.key);
            }
        }
        ready
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.ready_at.clear();
    }

    fn next_ready_at(&mut self) -> Option<Instant> {
        // Drop stale entries so the loop does not wake up for nothing.
        while let Some(next) = self.heap.peek() {
            if self.ready_at.get(&next.key) == Some(&next.ready_at) {
                return Some(next.ready_at);
            }
            self.heap.pop();
        }
        None
    }
}

#[derive(Debug)]
struct DelayState<K> {
    waiting: Mutex<Waiting<K>>,
    wake: Notify,
}

impl<K> DelayState<K> {
    fn lock(&self) -> MutexGuard<'_, Waiting<K>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`WorkQueue`] that can also add keys after a delay.
#[derive(Debug)]
pub struct DelayingQueue<K> {
    queue: WorkQueue<K>,
    delay: Arc<DelayState<K>>,
}

impl<K> Clone for DelayingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            delay: Arc::clone(&self.delay),
        }
    }
}

impl<K> Default for DelayingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DelayingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue and spawn its waiting loop.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let queue = WorkQueue::new();
        let delay = Arc::new(DelayState {
            waiting: Mutex::new(Waiting::new()),
            wake: Notify::new(),
        });

        tokio::spawn(waiting_loop(queue.clone(), Arc::clone(&delay)));

        Self { queue, delay }
    }

    /// Add `key` once `delay` has elapsed.
    ///
    /// If the key is already waiting with an earlier ready time, the earlier
    /// time is kept. A zero delay adds immediately.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(key);
            return;
        }

        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        if self.delay.lock().insert(key, ready_at) {
            self.delay.wake.notify_one();
        }
    }

    /// Number of keys waiting for their delay to expire.
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.delay.lock().ready_at.len()
    }

    /// See [`WorkQueue::add`].
    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    /// See [`WorkQueue::get`].
    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    /// See [`WorkQueue::done`].
    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    /// See [`WorkQueue::len`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`WorkQueue::is_empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Shut down the queue and stop the waiting loop.
    ///
    /// Keys still waiting for their delay are discarded.
    pub fn shut_down(&self) {
        self.queue.shut_down();
        self.delay.lock().clear();
        self.delay.wake.notify_one();
    }

    /// See [`WorkQueue::is_shutting_down`].
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}

async fn waiting_loop<K>(queue: WorkQueue<K>, delay: Arc<DelayState<K>>)
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    loop {
        let wake = delay.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        if queue.is_shutting_down() {
            // An add_after racing shut_down may have slipped in after the clear.
            delay.lock().clear();
            trace!("Waiting loop stopped");
            return;
        }

        let (ready, next) = {
            let mut waiting = delay.lock();
            let ready = waiting.pop_ready(Instant::now());
            (ready, waiting.next_ready_at())
        };

        for key in ready {
            queue.add(key);
        }

        match next {
            Some(deadline) => {
                tokio::select! {
                    () = sleep_until(deadline) => {}
                    () = &mut wake => {}
                }
            }
            None => wake.await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_after_delay() {
        let queue = DelayingQueue::new();
        let start = Instant::now();
        queue.add_after("ns/a", Duration::from_secs(5));

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.delayed_len(), 1);

        assert_eq!(queue.get().await, Some("ns/a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(queue.delayed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_ready_time_wins() {
        let queue = DelayingQueue::new();
        let start = Instant::now();
        queue.add_after("ns/a", Duration::from_secs(10));
        queue.add_after("ns/a", Duration::from_secs(2));
        queue.add_after("ns/a", Duration::from_secs(30));
        assert_eq!(queue.delayed_len(), 1);

        assert_eq!(queue.get().await, Some("ns/a"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(10));

        queue.done(&"ns/a");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(queue.len(), 0, "superseded timers must not fire again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_keys_ordered_by_ready_time() {
        let queue = DelayingQueue::new();
        queue.add_after("late", Duration::from_secs(3));
        queue.add_after("early", Duration::from_secs(1));
        queue.add_after("middle", Duration::from_secs(2));

        assert_eq!(queue.get().await, Some("early"));
        assert_eq!(queue.get().await, Some("middle"));
        assert_eq!(queue.get().await, Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_before_timer_fires_delivers_once() {
        let queue = DelayingQueue::new();
        queue.add_after("ns/a", Duration::from_secs(5));
        queue.add("ns/a");

        let key = queue.get().await.unwrap();
        assert_eq!(key, "ns/a");
        queue.done(&key);

        // The timer still fires and delivers the key again, once.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_while_ready_does_not_duplicate() {
        let queue = DelayingQueue::new();
        queue.add("ns/a");
        queue.add_after("ns/a", Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_immediate() {
        let queue = DelayingQueue::new();
        queue.add_after("ns/a", Duration::ZERO);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.delayed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ignores_delayed_adds() {
        let queue = DelayingQueue::new();
        queue.add_after("ns/a", Duration::from_secs(1));
        queue.shut_down();
        queue.add_after("ns/b", Duration::from_secs(1));
        assert_eq!(queue.delayed_len(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.delayed_len(), 0);
    }

    #[test]
    fn test_waiting_pop_skips_stale_entries() {
        let now = Instant::now();
        let mut waiting = Waiting::new();
        assert!(waiting.insert("a", now + Duration::from_secs(10)));
        assert!(waiting.insert("a", now + Duration::from_secs(1)));
        assert!(!waiting.insert("a", now + Duration::from_secs(5)));

        assert_eq!(waiting.next_ready_at(), Some(now + Duration::from_secs(1)));
        assert_eq!(waiting.pop_ready(now + Duration::from_secs(20)), vec!["a"]);
        assert_eq!(waiting.next_ready_at(), None);
    }
}
