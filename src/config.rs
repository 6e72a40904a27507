//! Configuration management for Glider.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GliderError, Result};
use crate::ratelimit::{FailurePolicy, LimiterSettings};

/// Main configuration for the Glider service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GliderConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Namespace prefix for every store key and channel
    #[serde(default = "default_partition_key")]
    pub partition_key: String,

    /// Requests allowed per window
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Interval between queue flushes in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Entries held by each local cache
    #[serde(default = "default_cache_size")]
    pub local_cache_size: u64,

    /// Verdict when the shared store cannot create a window
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            partition_key: default_partition_key(),
            quota: default_quota(),
            window_secs: default_window_secs(),
            flush_interval_ms: default_flush_interval(),
            local_cache_size: default_cache_size(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_partition_key() -> String {
    "glider".to_string()
}

fn default_quota() -> u64 {
    1000
}

fn default_window_secs() -> u64 {
    3600
}

fn default_flush_interval() -> u64 {
    2000
}

fn default_cache_size() -> u64 {
    500
}

impl RateLimitingConfig {
    /// Check that every numeric setting is positive.
    pub fn validate(&self) -> Result<()> {
        if self.partition_key.is_empty() {
            return Err(GliderError::Config("partition_key must not be empty".into()));
        }
        for (name, value) in [
            ("quota", self.quota),
            ("window_secs", self.window_secs),
            ("flush_interval_ms", self.flush_interval_ms),
            ("local_cache_size", self.local_cache_size),
        ] {
            if value == 0 {
                return Err(GliderError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Convert into the settings consumed by the admission engine.
    pub fn to_settings(&self) -> Result<LimiterSettings> {
        self.validate()?;
        Ok(LimiterSettings {
            partition_key: self.partition_key.clone(),
            quota: self.quota,
            window: Duration::from_secs(self.window_secs),
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            local_cache_capacity: self.local_cache_size,
            failure_policy: self.failure_policy,
        })
    }
}

/// Which shared store implementation to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// In-process store; only meaningful for a single instance
    Memory,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the Redis backend
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

impl GliderConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GliderError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file layered with `GLIDER__*`
    /// environment overrides (e.g. `GLIDER__RATE_LIMITING__QUOTA=50`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_yaml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };

        config::Config::builder()
            .add_source(
                config::Config::try_from(&base)
                    .map_err(|e| GliderError::Config(e.to_string()))?,
            )
            .add_source(
                config::Environment::with_prefix("GLIDER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GliderError::Config(e.to_string()))
    }
}
