//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Worker pool and notification handling.
    #[serde(default)]
    pub controller: ControllerSettings,
    /// Per-key retry policy.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Overall requeue rate limit shared by all keys.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSettings {
    /// Number of concurrent worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Drop update notifications whose old and new objects are identical.
    #[serde(default)]
    pub skip_identical_updates: bool,
    /// Capacity of the notification channel between the source and the queue.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Per-key retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Backoff applied after the first failure, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the backoff, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Number of requeues before a key is reported as permanently failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Token bucket configuration for requeues.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Tokens added per second.
    #[serde(default = "default_qps")]
    pub qps: f64,
    /// Bucket capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            skip_identical_updates: false,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl RetrySettings {
    /// Base backoff as a [`Duration`].
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum backoff as a [`Duration`].
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

const fn default_workers() -> usize {
    1
}

const fn default_channel_capacity() -> usize {
    1024
}

const fn default_base_delay_ms() -> u64 {
    5
}

const fn default_max_delay_ms() -> u64 {
    1_000_000
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_qps() -> f64 {
    10.0
}

const fn default_burst() -> u32 {
    100
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `PODWATCH_ENV`)
    /// 3. Environment variables with `PODWATCH__` prefix, e.g.
    ///    `PODWATCH__CONTROLLER__WORKERS=4`
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("PODWATCH_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("PODWATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PODWATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
