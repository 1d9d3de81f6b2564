//! Exponential backoff with jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StreamError;

/// Retry tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`
    pub jitter: bool,
    /// Give up after this many consecutive retryable failures (None = never)
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 60_000,
            multiplier: 1.3,
            jitter: true,
            max_retries: None,
        }
    }
}

/// Errors that know whether retrying them can help
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;

    /// Server-provided minimum delay before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl IsRetryable for StreamError {
    fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Network(_) | StreamError::Server { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            StreamError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Backoff state for one run of consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; never shorter than `hint`
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX).min(64);
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base.min(self.config.max_delay_ms as f64).max(0.0) as u64;

        let delay_ms = if self.config.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };

        let delay = Duration::from_millis(delay_ms);
        match hint {
            Some(min) if min > delay => min,
            _ => delay,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
