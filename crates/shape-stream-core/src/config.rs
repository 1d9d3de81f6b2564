//! Stream configuration
//!
//! Loaded from TOML with every field optional, then optionally overridden
//! from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryConfig;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_WAKE_THRESHOLD_MULTIPLIER: f64 = 3.0;
/// One day; longer periods make the timer useless as a wake signal
pub const MAX_POLL_INTERVAL_MS: u64 = 86_400_000;

/// Overrides `poll_interval_ms`
pub const ENV_POLL_INTERVAL: &str = "SHAPE_STREAM_POLL_INTERVAL_MS";
/// Overrides `wake_threshold_multiplier`
pub const ENV_WAKE_THRESHOLD: &str = "SHAPE_STREAM_WAKE_THRESHOLD";

/// What the host environment offers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCapabilities {
    /// The host reports page visibility changes, which replace timer-based
    /// wake detection
    pub has_visibility_api: bool,
}

impl HostCapabilities {
    /// A host without visibility notifications (servers, CLIs)
    pub fn headless() -> Self {
        Self::default()
    }

    pub fn with_visibility_api() -> Self {
        Self {
            has_visibility_api: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Wake-detection timer period
    pub poll_interval_ms: u64,
    /// A tick arriving after `poll_interval * multiplier` or more counts as a wake
    pub wake_threshold_multiplier: f64,
    pub retry: RetryConfig,
    pub host: HostCapabilities,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            wake_threshold_multiplier: DEFAULT_WAKE_THRESHOLD_MULTIPLIER,
            retry: RetryConfig::default(),
            host: HostCapabilities::default(),
        }
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Smallest tick-to-tick gap treated as a wake
    pub fn wake_threshold(&self) -> Result<Duration, ConfigError> {
        let secs = self.poll_interval().as_secs_f64() * self.wake_threshold_multiplier;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            ConfigError::Invalid(format!(
                "wake threshold overflows: {} ms * {}",
                self.poll_interval_ms, self.wake_threshold_multiplier
            ))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any lookup (the environment, in practice)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_POLL_INTERVAL) {
            self.poll_interval_ms =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_POLL_INTERVAL,
                    value,
                })?;
        }
        if let Some(value) = lookup(ENV_WAKE_THRESHOLD) {
            self.wake_threshold_multiplier =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_WAKE_THRESHOLD,
                    value,
                })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be at most {MAX_POLL_INTERVAL_MS}, got {}",
                self.poll_interval_ms
            )));
        }
        if !self.wake_threshold_multiplier.is_finite() || self.wake_threshold_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "wake_threshold_multiplier must be at least 1, got {}",
                self.wake_threshold_multiplier
            )));
        }
        self.wake_threshold()?;
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}
