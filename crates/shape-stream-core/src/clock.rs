//! Wall-clock sources
//!
//! Wake detection compares wall-clock time against timer ticks, so the clock
//! is injected rather than read from a global.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that follows tokio's timer and can be jumped forward
///
/// Elapsed time is measured with [`tokio::time::Instant`], so under a paused
/// runtime it moves with `tokio::time::advance`. [`ManualClock::jump`] moves
/// wall-clock time without firing any timers, which is what a host looks like
/// after it wakes from sleep.
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Move wall-clock time forward without advancing timers
    pub fn jump(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let offset = chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst));
        self.origin + elapsed + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_manual_clock_follows_tokio_time() {
        let clock = ManualClock::new();
        let t0 = clock.now();

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert_eq!((clock.now() - t0).num_milliseconds(), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_clock_jump() {
        let clock = ManualClock::new();
        let t0 = clock.now();

        clock.jump(Duration::from_secs(10));
        assert_eq!((clock.now() - t0).num_milliseconds(), 10_000);
    }
}
