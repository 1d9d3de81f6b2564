//! Wake-from-sleep detection
//!
//! A recurring timer compares wall-clock time between its own ticks. When a
//! tick arrives much later than its period allows, the host was almost
//! certainly suspended, and any long-poll request in flight is sitting on a
//! dead connection. The detector reports that through its `on_wake` callback.
//!
//! At most one timer exists per detector: [`WakeDetector::arm`] is a
//! compare-and-set on the timer slot, so repeated starts cannot stack timers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{HostCapabilities, StreamConfig};
use crate::error::ConfigError;

/// Timer bookkeeping, for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeDetectorStats {
    /// Timers created over the detector's lifetime
    pub timers_created: usize,
    /// Timers cleared over the detector's lifetime
    pub timers_cleared: usize,
    /// Whether a timer is alive right now
    pub active: bool,
}

pub struct WakeDetector {
    interval: Duration,
    threshold: Duration,
    clock: Arc<dyn Clock>,
    installed: bool,
    slot: Mutex<Option<JoinHandle<()>>>,
    created: AtomicUsize,
    cleared: AtomicUsize,
}

impl WakeDetector {
    pub fn new(
        interval: Duration,
        threshold: Duration,
        clock: Arc<dyn Clock>,
        host: HostCapabilities,
    ) -> Self {
        Self {
            interval,
            threshold,
            clock,
            // Visibility notifications are the better wake signal where available
            installed: !host.has_visibility_api,
            slot: Mutex::new(None),
            created: AtomicUsize::new(0),
            cleared: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &StreamConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.poll_interval(),
            config.wake_threshold()?,
            clock,
            config.host,
        ))
    }

    /// Whether this host uses timer-based detection at all
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Smallest tick-to-tick gap treated as a wake
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start the timer unless one is already running
    ///
    /// Returns true only if a new timer was created. Must be called from
    /// within a tokio runtime.
    pub fn arm<F>(&self, on_wake: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.installed {
            debug!("WakeDetector: host has visibility API, timer not installed");
            return false;
        }

        let mut slot = self.slot.lock();
        if slot.is_some() {
            debug!("WakeDetector: already armed, skipping");
            return false;
        }

        let last_tick = self.clock.now();
        let first_tick = Instant::now() + self.interval;
        let handle = tokio::spawn(tick_loop(
            self.interval,
            self.threshold,
            self.clock.clone(),
            last_tick,
            first_tick,
            on_wake,
        ));
        *slot = Some(handle);
        self.created.fetch_add(1, Ordering::SeqCst);

        debug!(
            interval_ms = self.interval.as_millis() as u64,
            threshold_ms = self.threshold.as_millis() as u64,
            "WakeDetector: armed"
        );
        true
    }

    /// Stop the timer. Returns true if one was running.
    pub fn disarm(&self) -> bool {
        let Some(handle) = self.slot.lock().take() else {
            return false;
        };
        handle.abort();
        self.cleared.fetch_add(1, Ordering::SeqCst);
        debug!("WakeDetector: disarmed");
        true
    }

    pub fn stats(&self) -> WakeDetectorStats {
        WakeDetectorStats {
            timers_created: self.created.load(Ordering::SeqCst),
            timers_cleared: self.cleared.load(Ordering::SeqCst),
            active: self.is_armed(),
        }
    }
}

impl Drop for WakeDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for WakeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeDetector")
            .field("interval", &self.interval)
            .field("threshold", &self.threshold)
            .field("installed", &self.installed)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Whether a tick-to-tick gap is a wake. A clock that moved backwards is not.
pub fn is_wake_gap(delta: chrono::Duration, threshold: Duration) -> bool {
    delta.to_std().map(|gap| gap >= threshold).unwrap_or(false)
}

async fn tick_loop<F>(
    interval: Duration,
    threshold: Duration,
    clock: Arc<dyn Clock>,
    mut last_tick: DateTime<Utc>,
    first_tick: Instant,
    on_wake: F,
) where
    F: Fn() + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = clock.now();
        let delta = now.signed_duration_since(last_tick);
        // Updated on every tick so one sleep is reported once
        last_tick = now;

        if is_wake_gap(delta, threshold) {
            warn!(
                gap_ms = delta.num_milliseconds(),
                threshold_ms = threshold.as_millis() as u64,
                "WakeDetector: wall-clock gap, host likely woke from sleep"
            );
            on_wake();
        } else {
            debug!(gap_ms = delta.num_milliseconds(), "WakeDetector: tick");
        }
    }
}
