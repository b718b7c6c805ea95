//! Common utilities and shared types for podwatch.
//!
//! This crate provides foundational components used across all podwatch crates:
//!
//! - **Configuration**: Controller, retry and rate limit settings via [`Config`]
//! - **Error handling**: Startup error types via [`AppError`] and [`AppResult`]
//! - **Metrics**: Controller counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use podwatch_common::{AppResult, Config};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     println!("Running {} workers", config.controller.workers);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;

pub use config::{Config, ControllerSettings, RateLimitSettings, RetrySettings};
pub use error::{AppError, AppResult};
pub use metrics::{Metrics, MetricsSnapshot, Timer};
