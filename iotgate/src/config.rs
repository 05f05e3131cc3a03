//! Gateway configuration.
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid config. Durations are written in milliseconds:
//!
//! ```yaml
//! message:
//!   max_length: 1024
//!   publish_interval_ms: 100
//!   expire_ms: 300000
//! cache:
//!   sweep_interval_ms: 60000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default maximum payload length in bytes.
pub const DEFAULT_MAX_LENGTH: usize = 1024;

/// Default minimum interval between two publishes of one client.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Default lifetime of a staged message.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(5 * 60);

/// Default period of the staged-message sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub message: MessageConfig,
    pub cache: CacheConfig,
}

/// Limits applied to published messages and staged deliveries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Maximum payload length in bytes.
    pub max_length: usize,
    /// Minimum interval between two accepted publishes of one client.
    #[serde(rename = "publish_interval_ms", with = "millis")]
    pub publish_interval: Duration,
    /// Staged messages at least this old are never delivered.
    #[serde(rename = "expire_ms", with = "millis")]
    pub expire: Duration,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            expire: DEFAULT_EXPIRE,
        }
    }
}

/// Device cache housekeeping.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Period of the expired-message sweep.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Set the maximum payload length.
    pub fn max_length(mut self, len: usize) -> Self {
        self.message.max_length = len;
        self
    }

    /// Set the minimum inter-publish interval.
    pub fn publish_interval(mut self, interval: Duration) -> Self {
        self.message.publish_interval = interval;
        self
    }

    /// Set the staged-message lifetime.
    pub fn expire(mut self, expire: Duration) -> Self {
        self.message.expire = expire;
        self
    }

    /// Set the sweep period.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.cache.sweep_interval = interval;
        self
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.message.max_length == 0 {
            return Err(Error::InvalidConfig("message.max_length must be > 0".to_string()));
        }
        if self.message.expire.is_zero() {
            return Err(Error::InvalidConfig("message.expire_ms must be > 0".to_string()));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("cache.sweep_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
