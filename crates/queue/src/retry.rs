//! Retry configuration and dead letter records.

use std::fmt;
use std::time::Duration;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of requeues before a key is given up on.
    pub max_retries: u32,
    /// Delay applied after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for the given attempt number (0-indexed).
    ///
    /// `min(max_delay, initial_delay * multiplier^attempt)`. Results that
    /// overflow or are not finite clamp to `max_delay`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if delay_nanos.is_finite() && delay_nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(delay_nanos.max(0.0) as u64)
        } else {
            self.max_delay
        }
    }

    /// Check if we should retry after the given number of requeues.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Dead letter record for a key that was given up on.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry<T> {
    /// The failed key.
    pub job: T,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Timestamp of last failure.
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

impl<T> DeadLetterEntry<T> {
    /// Create a new dead letter entry.
    pub fn new(job: T, attempts: u32, error: String) -> Self {
        Self {
            job,
            attempts,
            last_error: error,
            failed_at: chrono::Utc::now(),
        }
    }
}

impl<T: fmt::Display> fmt::Display for DeadLetterEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempts: {}",
            self.job, self.attempts, self.last_error
        )
    }
}
