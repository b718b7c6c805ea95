//! Controller: turns notifications into keys and drives the worker loops.
//!
//! A [`Controller`] owns one [`RateLimitingQueue`] of `namespace/name` keys.
//! Notifications go through [`Controller::handle`] (or an event pump fed by a
//! channel), workers started with [`Controller::start`] pull keys and hand them
//! to the [`Reconciler`], and [`Controller::stop`] drains the queue and waits
//! for every worker to exit.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use podwatch_common::{Metrics, MetricsSnapshot, Timer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::key::{KeyError, Notification, meta_namespace_key, split_meta_namespace_key};
use crate::rate_limit::{RateLimitConfig, RateLimiter, default_controller_rate_limiter};
use crate::rate_limiting::RateLimitingQueue;
use crate::retry::{DeadLetterEntry, RetryConfig};

/// Failure returned by a [`Reconciler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Worth trying again later; the key is requeued with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will not succeed on replay; the key is dropped and reported.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Per-key failures handed to the [`ErrorSink`].
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No key could be derived from a notification; it was dropped.
    #[error("dropping {action} notification: {source}")]
    Extraction {
        action: &'static str,
        #[source]
        source: KeyError,
    },

    /// A queued key could not be split into namespace and name.
    #[error("dropping malformed key: {0}")]
    MalformedKey(#[source] KeyError),

    /// The reconciler reported a permanent failure.
    #[error("reconcile of {key} failed permanently: {reason}")]
    Permanent { key: String, reason: String },

    /// The key kept failing until the retry ceiling was reached.
    #[error("giving up: {0}")]
    GaveUp(DeadLetterEntry<String>),

    /// The reconciler panicked.
    #[error("reconcile of {key} panicked: {message}")]
    Panicked { key: String, message: String },
}

impl ControllerError {
    /// The key this error concerns, if one was derived.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Extraction { .. } => None,
            Self::MalformedKey(KeyError::InvalidKey(key)) => Some(key.as_str()),
            Self::MalformedKey(_) => None,
            Self::Permanent { key, .. } | Self::Panicked { key, .. } => Some(key.as_str()),
            Self::GaveUp(entry) => Some(entry.job.as_str()),
        }
    }
}

/// Business logic run for each key.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Bring the object identified by `key` to its desired state.
    ///
    /// The controller never runs two reconciles of the same key at once.
    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError>;
}

/// Destination for per-key failures. Must not block.
pub trait ErrorSink: Send + Sync {
    /// Report a failure. The controller carries on regardless.
    fn report(&self, error: ControllerError);
}

/// Error sink that logs every failure at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: ControllerError) {
        error!(key = error.key(), error = %error, "Controller error");
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Per-key backoff and retry ceiling.
    pub retry: RetryConfig,
    /// Overall requeue token bucket.
    pub rate_limit: RateLimitConfig,
    /// Drop update notifications whose old and new objects are identical.
    pub skip_identical_updates: bool,
}

struct Shared {
    queue: RateLimitingQueue<String>,
    reconciler: Arc<dyn Reconciler>,
    sink: Arc<dyn ErrorSink>,
    config: ControllerConfig,
    metrics: Metrics,
    workers: Mutex<JoinSet<()>>,
}

impl Drop for Shared {
    // Lets the delay loop exit when the last handle goes away without stop().
    fn drop(&mut self) {
        self.queue.shut_down();
    }
}

/// Releases a key on every exit path of a worker iteration.
struct DoneGuard<'a> {
    queue: &'a RateLimitingQueue<String>,
    key: &'a String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// Reconciliation controller.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Create a controller using the default rate limiter: per-key
    /// exponential backoff bounded by an overall token bucket.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        sink: Arc<dyn ErrorSink>,
        config: ControllerConfig,
    ) -> Self {
        let limiter = Arc::new(default_controller_rate_limiter::<String>(
            &config.retry,
            &config.rate_limit,
        ));
        Self::with_rate_limiter(reconciler, sink, config, limiter)
    }

    /// Create a controller with a custom rate limiter.
    ///
    /// The retry ceiling of `config.retry` still applies.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn with_rate_limiter(
        reconciler: Arc<dyn Reconciler>,
        sink: Arc<dyn ErrorSink>,
        config: ControllerConfig,
        limiter: Arc<dyn RateLimiter<String>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: RateLimitingQueue::new(limiter),
                reconciler,
                sink,
                config,
                metrics: Metrics::new(),
                workers: Mutex::new(JoinSet::new()),
            }),
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.shared
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue the key of a notification.
    ///
    /// Returns whether a key was handed to the queue. Notifications without a
    /// derivable key are dropped and reported, never retried.
    pub fn handle(&self, notification: &Notification) -> bool {
        let shared = &self.shared;

        if shared.config.skip_identical_updates && notification.is_noop_update() {
            trace!("Skipping update with identical objects");
            shared.metrics.record_notification(false);
            shared.metrics.record_update_skipped();
            return false;
        }

        match meta_namespace_key(notification.object()) {
            Ok(key) => {
                trace!(key = %key, action = notification.action(), "Enqueuing key");
                shared.queue.add(key);
                shared.metrics.record_notification(true);
                true
            }
            Err(source) => {
                shared.metrics.record_notification(false);
                shared.metrics.record_extraction_failure();
                shared.sink.report(ControllerError::Extraction {
                    action: notification.action(),
                    source,
                });
                false
            }
        }
    }

    /// Forward every notification received on `notifications` to
    /// [`handle`](Self::handle) until the channel closes.
    pub fn spawn_event_pump(
        &self,
        mut notifications: mpsc::Receiver<Notification>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                controller.handle(&notification);
            }
            debug!("Notification channel closed");
        })
    }

    /// Spawn `worker_count` worker loops (at least one).
    pub fn start(&self, worker_count: usize) {
        let worker_count = worker_count.max(1);
        let mut workers = self.lock_workers();
        for worker in 0..worker_count {
            let controller = self.clone();
            workers.spawn(async move {
                debug!(worker, "Worker started");
                while controller.process_next_item().await {}
                debug!(worker, "Worker stopped");
            });
        }
        info!(workers = worker_count, "Controller started");
    }

    /// Shut down the queue and wait for every worker to drain and exit.
    pub async fn stop(&self) {
        info!(queue_len = self.queue_len(), "Stopping controller");
        self.shared.queue.shut_down();

        let mut workers = std::mem::take(&mut *self.lock_workers());
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Controller stopped");
    }

    /// Take one key off the queue and reconcile it.
    ///
    /// Returns `false` once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let shared = &self.shared;
        let Some(key) = shared.queue.get().await else {
            return false;
        };
        let _done = DoneGuard {
            queue: &shared.queue,
            key: &key,
        };

        if let Err(e) = split_meta_namespace_key(&key) {
            shared.queue.forget(&key);
            shared.metrics.record_malformed_key();
            shared.sink.report(ControllerError::MalformedKey(e));
            return true;
        }

        info!(
            key = %key,
            queue_len = shared.queue.len(),
            num_retry = shared.queue.num_requeues(&key),
            "Reconciling key"
        );

        let timer = Timer::start();
        let result = AssertUnwindSafe(shared.reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        shared.metrics.record_reconcile(timer.elapsed());

        match result {
            Ok(Ok(())) => {
                shared.queue.forget(&key);
                shared.metrics.record_success();
                debug!(key = %key, "Reconciled");
            }
            Ok(Err(ReconcileError::Retryable(reason))) => self.requeue(&key, reason),
            Ok(Err(ReconcileError::Permanent(reason))) => {
                shared.queue.forget(&key);
                shared.metrics.record_permanent_failure();
                shared.sink.report(ControllerError::Permanent {
                    key: key.clone(),
                    reason,
                });
            }
            Err(panic) => {
                shared.queue.forget(&key);
                shared.metrics.record_panic();
                shared.metrics.record_permanent_failure();
                shared.sink.report(ControllerError::Panicked {
                    key: key.clone(),
                    message: panic_message(panic.as_ref()),
                });
            }
        }

        true
    }

    #[allow(clippy::ptr_arg)]
    fn requeue(&self, key: &String, reason: String) {
        let shared = &self.shared;
        let requeues = shared.queue.num_requeues(key);

        // A requeue after shutdown would be discarded; drain the key instead.
        if shared.queue.is_shutting_down() {
            debug!(key = %key, error = %reason, "Reconcile failed during shutdown, not requeuing");
            shared.queue.forget(key);
            return;
        }

        if shared.config.retry.should_retry(requeues) {
            warn!(key = %key, attempt = requeues + 1, error = %reason, "Reconcile failed, requeuing");
            shared.queue.add_rate_limited(key.clone());
            shared.metrics.record_retry();
            return;
        }

        shared.queue.forget(key);
        shared.metrics.record_permanent_failure();
        shared.sink.report(ControllerError::GaveUp(DeadLetterEntry::new(
            key.clone(),
            requeues.saturating_add(1),
            reason,
        )));
    }

    /// Whether [`stop`](Self::stop) has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.queue.is_shutting_down()
    }

    /// Number of keys ready for a worker.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of keys waiting out a backoff delay.
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.shared.queue.delayed_len()
    }

    /// Number of requeues of `key` since its last success.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.shared.queue.num_requeues(&key.to_string())
    }

    /// Snapshot of the controller counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Controller counters in Prometheus text format.
    #[must_use]
    pub fn metrics_prometheus(&self) -> String {
        self.shared.metrics.to_prometheus(self.queue_len())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Noop;

    #[async_trait]
    impl Reconciler for Noop {
        async fn reconcile(&self, _key: &str) -> Result<(), ReconcileError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ErrorSink for Collect {
        fn report(&self, error: ControllerError) {
            self.0.lock().unwrap().push(error.to_string());
        }
    }

    fn pod(namespace: &str, name: &str) -> serde_json::Value {
        json!({ "metadata": { "namespace": namespace, "name": name } })
    }

    #[tokio::test]
    async fn test_handle_coalesces_notifications() {
        let controller = Controller::new(
            Arc::new(Noop),
            Arc::new(TracingErrorSink),
            ControllerConfig::default(),
        );

        assert!(controller.handle(&Notification::Add(pod("ns", "a"))));
        assert!(controller.handle(&Notification::Update {
            old: pod("ns", "a"),
            new: pod("ns", "a"),
        }));
        assert!(controller.handle(&Notification::Delete(pod("ns", "a"))));

        assert_eq!(controller.queue_len(), 1);
        assert_eq!(controller.metrics().keys_enqueued, 3);
    }

    #[tokio::test]
    async fn test_handle_reports_extraction_failure() {
        let sink = Arc::new(Collect::default());
        let controller = Controller::new(Arc::new(Noop), sink.clone(), ControllerConfig::default());

        assert!(!controller.handle(&Notification::Add(json!({ "kind": "Pod" }))));

        assert_eq!(controller.queue_len(), 0);
        assert_eq!(controller.metrics().extraction_failures, 1);
        let reported = sink.0.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("create"));
    }

    #[tokio::test]
    async fn test_skip_identical_updates() {
        let controller = Controller::new(
            Arc::new(Noop),
            Arc::new(TracingErrorSink),
            ControllerConfig {
                skip_identical_updates: true,
                ..Default::default()
            },
        );

        assert!(!controller.handle(&Notification::Update {
            old: pod("ns", "a"),
            new: pod("ns", "a"),
        }));
        assert!(controller.handle(&Notification::Update {
            old: pod("ns", "a"),
            new: json!({ "metadata": { "namespace": "ns", "name": "a", "labels": { "x": "1" } } }),
        }));

        let metrics = controller.metrics();
        assert_eq!(metrics.updates_skipped, 1);
        assert_eq!(metrics.notifications_received, 2);
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let sink = Arc::new(Collect::default());
        let controller = Controller::new(Arc::new(Noop), sink.clone(), ControllerConfig::default());

        controller.handle(&Notification::Delete(json!({ "key": "a/b/c" })));
        assert!(controller.process_next_item().await);

        assert_eq!(controller.metrics().malformed_keys, 1);
        assert_eq!(controller.queue_len(), 0);
        assert!(sink.0.lock().unwrap()[0].contains("a/b/c"));
    }

    #[tokio::test]
    async fn test_dropping_controller_shuts_queue_down() {
        let controller = Controller::new(
            Arc::new(Noop),
            Arc::new(TracingErrorSink),
            ControllerConfig::default(),
        );
        let queue = controller.shared.queue.clone();

        drop(controller);
        assert!(queue.is_shutting_down());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_error_key() {
        let err = ControllerError::GaveUp(DeadLetterEntry::new("ns/a".to_string(), 3, "x".to_string()));
        assert_eq!(err.key(), Some("ns/a"));
        assert_eq!(err.to_string(), "giving up: ns/a failed after 3 attempts: x");

        let err = ControllerError::Extraction {
            action: "update",
            source: KeyError::MissingName,
        };
        assert_eq!(err.key(), None);
    }
}
