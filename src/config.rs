//! Configuration management.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::ratelimit::LimiterSettings;

/// Prefix for environment variable overrides, e.g. `SWC_LIMITER__LIMIT=100`.
pub const ENV_PREFIX: &str = "SWC";

/// Main configuration for the `swc` binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Quota and bucketing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum weighted events per period
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Bucket width in milliseconds
    #[serde(default = "default_counter_window_ms")]
    pub counter_window_ms: u64,

    /// Namespace for this limiter's keys in a shared store
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            period_secs: default_period_secs(),
            counter_window_ms: default_counter_window_ms(),
            key_prefix: None,
        }
    }
}

fn default_limit() -> u64 {
    60
}

fn default_period_secs() -> u64 {
    60
}

fn default_counter_window_ms() -> u64 {
    1000
}

impl LimiterConfig {
    /// Convert to validated limiter settings.
    pub fn to_settings(&self) -> Result<LimiterSettings> {
        let settings = LimiterSettings {
            limit: self.limit,
            period: Duration::from_secs(self.period_secs),
            counter_window: Duration::from_millis(self.counter_window_ms),
            key_prefix: self.key_prefix.clone(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store
    #[default]
    Memory,
    /// Shared Redis store (requires the `redis` feature)
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from an optional YAML file layered with
    /// `SWC_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.limiter.to_settings()?;
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(Error::Config("redis_url is required for the redis backend".into()));
        }
        Ok(())
    }
}
