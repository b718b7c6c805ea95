//! Deduplicating work queue with per-key processing exclusion.
//!
//! The queue tracks three pieces of state under one lock:
//!
//! - `queue`: keys ready to be handed to a worker, in FIFO order.
//! - `dirty`: keys that need processing. Every key in `queue` is dirty; a key
//!   that is dirty *and* processing received a notification while a worker
//!   held it.
//! - `processing`: keys currently checked out by a worker.
//!
//! | operation | not tracked | dirty, queued | processing | processing + dirty |
//! |-----------|-------------|---------------|------------|-------------------|
//! | `add`     | dirty, queued | no-op       | processing + dirty | no-op     |
//! | `get`     | -           | processing    | -          | -                 |
//! | `done`    | no-op       | no-op         | not tracked | dirty, queued    |
//!
//! A key is never in `queue` and `processing` at the same time, so no two
//! workers can hold the same key.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

/// Thread-safe deduplicating FIFO queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing.
    ///
    /// Repeated calls before the key is picked up coalesce into one delivery.
    /// If a worker currently holds the key, it is redelivered after that
    /// worker calls [`done`](Self::done). Ignored after shutdown.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next ready key.
    ///
    /// Returns `None` once the queue is shut down and every ready key has been
    /// handed out. The caller owns the returned key until it calls
    /// [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent add or shutdown cannot
            // slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing.
    ///
    /// If the key was added again while it was being processed, it goes back
    /// into the ready queue now.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if !state.dirty.contains(key) {
            return;
        }

        state.queue.push_back(key.clone());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Number of keys ready to be handed to a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no keys are ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Number of keys currently held by workers.
    #[must_use]
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    /// Stop accepting keys and wake every waiting [`get`](Self::get).
    ///
    /// Keys already ready are still handed out. Calling this more than once
    /// has no further effect.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
