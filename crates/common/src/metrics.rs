//! Metrics collection for podwatch.
//!
//! Counters describing what the controller did with the keys it was handed,
//! for external scraping. Each controller owns its own [`Metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Controller metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Notification Metrics ===
    /// Notifications received from the source
    pub notifications_received: AtomicU64,
    /// Notifications whose key was handed to the queue
    pub keys_enqueued: AtomicU64,
    /// Notifications dropped because no key could be derived
    pub extraction_failures: AtomicU64,
    /// Update notifications skipped because nothing changed
    pub updates_skipped: AtomicU64,

    // === Reconcile Metrics ===
    /// Keys taken off the queue by a worker
    pub keys_processed: AtomicU64,
    /// Successful reconciliations
    pub reconcile_success: AtomicU64,
    /// Retryable failures that were requeued with backoff
    pub reconcile_retries: AtomicU64,
    /// Keys dropped after a permanent failure or exhausted retries
    pub permanent_failures: AtomicU64,
    /// Keys dropped because the key itself was malformed
    pub malformed_keys: AtomicU64,
    /// Reconciler panics caught by a worker
    pub reconcile_panics: AtomicU64,
    /// Total reconcile time in microseconds
    pub reconcile_time_us_total: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            notifications_received: AtomicU64::new(0),
            keys_enqueued: AtomicU64::new(0),
            extraction_failures: AtomicU64::new(0),
            updates_skipped: AtomicU64::new(0),

            keys_processed: AtomicU64::new(0),
            reconcile_success: AtomicU64::new(0),
            reconcile_retries: AtomicU64::new(0),
            permanent_failures: AtomicU64::new(0),
            malformed_keys: AtomicU64::new(0),
            reconcile_panics: AtomicU64::new(0),
            reconcile_time_us_total: AtomicU64::new(0),
        }
    }

    /// Record an incoming notification and whether its key was enqueued.
    pub fn record_notification(&self, enqueued: bool) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
        if enqueued {
            self.keys_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a notification dropped during key extraction.
    pub fn record_extraction_failure(&self) {
        self.extraction_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an update notification skipped as a no-op.
    pub fn record_update_skipped(&self) {
        self.updates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a key handed to the reconciler and how long it took.
    pub fn record_reconcile(&self, duration: Duration) {
        self.keys_processed.fetch_add(1, Ordering::Relaxed);
        self.reconcile_time_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a successful reconciliation.
    pub fn record_success(&self) {
        self.reconcile_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retryable failure that was requeued.
    pub fn record_retry(&self) {
        self.reconcile_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a key that was given up on.
    pub fn record_permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a key that could not be split into namespace and name.
    pub fn record_malformed_key(&self) {
        self.malformed_keys.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reconciler panic.
    pub fn record_panic(&self) {
        self.reconcile_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of keys and notifications dropped without reconciling.
    #[must_use]
    pub fn drops_total(&self) -> u64 {
        self.extraction_failures.load(Ordering::Relaxed)
            + self.malformed_keys.load(Ordering::Relaxed)
            + self.permanent_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            keys_enqueued: self.keys_enqueued.load(Ordering::Relaxed),
            extraction_failures: self.extraction_failures.load(Ordering::Relaxed),
            updates_skipped: self.updates_skipped.load(Ordering::Relaxed),

            keys_processed: self.keys_processed.load(Ordering::Relaxed),
            reconcile_success: self.reconcile_success.load(Ordering::Relaxed),
            reconcile_retries: self.reconcile_retries.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            malformed_keys: self.malformed_keys.load(Ordering::Relaxed),
            reconcile_panics: self.reconcile_panics.load(Ordering::Relaxed),
            reconcile_avg_time_us: self.average_reconcile_time_us(),
            drops_total: self.drops_total(),
        }
    }

    /// Calculate average reconcile time.
    fn average_reconcile_time_us(&self) -> u64 {
        let total = self.reconcile_time_us_total.load(Ordering::Relaxed);
        let count = self.keys_processed.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }

    /// Export metrics in Prometheus format.
    ///
    /// `queue_len` is sampled by the caller since the counters do not own
    /// the queue.
    #[must_use]
    pub fn to_prometheus(&self, queue_len: usize) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP podwatch_queue_length Keys ready for a worker\n");
        output.push_str("# TYPE podwatch_queue_length gauge\n");
        output.push_str(&format!("podwatch_queue_length {queue_len}\n"));

        // Notification metrics
        output.push_str("# HELP podwatch_notifications_total Notifications received\n");
        output.push_str("# TYPE podwatch_notifications_total counter\n");
        output.push_str(&format!(
            "podwatch_notifications_total {}\n",
            snapshot.notifications_received
        ));

        output.push_str("# HELP podwatch_keys_enqueued_total Keys handed to the queue\n");
        output.push_str("# TYPE podwatch_keys_enqueued_total counter\n");
        output.push_str(&format!(
            "podwatch_keys_enqueued_total {}\n",
            snapshot.keys_enqueued
        ));

        // Reconcile metrics
        output.push_str("# HELP podwatch_reconcile_total Reconcile attempts by result\n");
        output.push_str("# TYPE podwatch_reconcile_total counter\n");
        output.push_str(&format!(
            "podwatch_reconcile_total{{result=\"success\"}} {}\n",
            snapshot.reconcile_success
        ));
        output.push_str(&format!(
            "podwatch_reconcile_total{{result=\"retry\"}} {}\n",
            snapshot.reconcile_retries
        ));
        output.push_str(&format!(
            "podwatch_reconcile_total{{result=\"panic\"}} {}\n",
            snapshot.reconcile_panics
        ));

        output.push_str("# HELP podwatch_reconcile_avg_time_us Average reconcile time\n");
        output.push_str("# TYPE podwatch_reconcile_avg_time_us gauge\n");
        output.push_str(&format!(
            "podwatch_reconcile_avg_time_us {}\n",
            snapshot.reconcile_avg_time_us
        ));

        // Drops
        output.push_str("# HELP podwatch_drops_total Notifications and keys dropped by reason\n");
        output.push_str("# TYPE podwatch_drops_total counter\n");
        output.push_str(&format!(
            "podwatch_drops_total{{reason=\"extraction\"}} {}\n",
            snapshot.extraction_failures
        ));
        output.push_str(&format!(
            "podwatch_drops_total{{reason=\"malformed_key\"}} {}\n",
            snapshot.malformed_keys
        ));
        output.push_str(&format!(
            "podwatch_drops_total{{reason=\"permanent_failure\"}} {}\n",
            snapshot.permanent_failures
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    // Notifications
    pub notifications_received: u64,
    pub keys_enqueued: u64,
    pub extraction_failures: u64,
    pub updates_skipped: u64,

    // Reconcile
    pub keys_processed: u64,
    pub reconcile_success: u64,
    pub reconcile_retries: u64,
    pub permanent_failures: u64,
    pub malformed_keys: u64,
    pub reconcile_panics: u64,
    pub reconcile_avg_time_us: u64,

    // Totals
    pub drops_total: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
