//! Work queue and worker loop for podwatch.
//!
//! This crate turns a noisy stream of change notifications into an ordered,
//! rate-limited stream of "reconcile this key" tasks:
//!
//! - **Keys**: `namespace/name` extraction from notification payloads
//! - **Work queue**: Deduplication with at most one worker per key
//! - **Delaying queue**: Timed re-adds driven by a background waiting loop
//! - **Rate limiting**: Per-key exponential backoff and an overall token bucket
//! - **Retry**: Backoff policy, retry ceiling and dead letter records
//! - **Controller**: Worker loops, error routing and graceful shutdown

pub mod controller;
pub mod delaying;
pub mod key;
pub mod rate_limit;
pub mod rate_limiting;
pub mod retry;
pub mod work_queue;

pub use controller::{
    Controller, ControllerConfig, ControllerError, ErrorSink, ReconcileError, Reconciler,
    TracingErrorSink,
};
pub use delaying::DelayingQueue;
pub use key::{KeyError, Notification, meta_namespace_key, split_meta_namespace_key};
pub use rate_limit::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimitConfig,
    RateLimiter, default_controller_rate_limiter,
};
pub use rate_limiting::RateLimitingQueue;
pub use retry::{DeadLetterEntry, RetryConfig};
pub use work_queue::WorkQueue;
