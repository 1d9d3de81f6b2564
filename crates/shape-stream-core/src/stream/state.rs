//! Session state for a shape stream
//!
//! Everything the driver, the wake callback and the pause protocol mutate
//! lives in one [`Session`] behind one short-lived lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancel::{CancelReason, CancelSignal};
use crate::protocol::{ShapeCursor, ShapeParams};

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Constructed, never started
    Idle,
    /// Driver spawned, first request not yet issued
    Starting,
    Polling,
    /// A snapshot owns the stream
    Paused,
    /// Torn down or failed; `start` begins a new generation
    Stopped,
}

impl StreamState {
    /// Whether a driver task belongs to this state
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            StreamState::Starting | StreamState::Polling | StreamState::Paused
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Polling => "polling",
            StreamState::Paused => "paused",
            StreamState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The main-stream request currently awaiting a response
#[derive(Debug)]
pub(crate) struct InFlight {
    pub id: u64,
    pub signal: CancelSignal,
    pub issued_at: DateTime<Utc>,
    /// When the wake detector is next expected to look at this request
    pub next_check_at: DateTime<Utc>,
}

impl InFlight {
    pub fn new(id: u64, issued_at: DateTime<Utc>, check_interval: Duration) -> Self {
        let next_check_at = chrono::Duration::from_std(check_interval)
            .ok()
            .and_then(|interval| issued_at.checked_add_signed(interval))
            .unwrap_or(issued_at);
        Self {
            id,
            signal: CancelSignal::new(),
            issued_at,
            next_check_at,
        }
    }
}

pub(crate) struct Session {
    pub state: StreamState,
    /// Bumped on every start and stop; continuations from an older
    /// generation discard their results
    pub generation: u64,
    pub in_flight: Option<InFlight>,
    pub snapshot_signal: Option<CancelSignal>,
    pub params: ShapeParams,
    pub headers: BTreeMap<String, String>,
    pub cursor: ShapeCursor,
    /// Parent of the driver's shutdown token; replaced on every new generation
    pub shutdown: CancellationToken,
    pub driver: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(params: ShapeParams, headers: BTreeMap<String, String>) -> Self {
        Self {
            state: StreamState::Idle,
            generation: 0,
            in_flight: None,
            snapshot_signal: None,
            params,
            headers,
            cursor: ShapeCursor::new(),
            shutdown: CancellationToken::new(),
            driver: None,
        }
    }

    /// Begin a new generation. Returns its number.
    pub fn begin_generation(&mut self) -> u64 {
        self.generation += 1;
        self.shutdown = CancellationToken::new();
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Settle the in-flight request if it still belongs to this generation
    ///
    /// Returns false for a stale continuation.
    pub fn settle(&mut self, generation: u64, request_id: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        match &self.in_flight {
            Some(req) if req.id == request_id => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel the in-flight main request. Returns its id if there was one.
    pub fn cancel_in_flight(&self, reason: CancelReason) -> Option<u64> {
        let req = self.in_flight.as_ref()?;
        req.signal.cancel(reason);
        Some(req.id)
    }

    /// End the current generation: cancel everything it owns
    ///
    /// The caller updates `state`.
    pub fn end_generation(&mut self) {
        self.generation += 1;
        self.cancel_all(CancelReason::Stopped);
        self.shutdown.cancel();
    }

    /// Cancel the in-flight and snapshot requests
    pub fn cancel_all(&mut self, reason: CancelReason) {
        if let Some(req) = self.in_flight.take() {
            req.signal.cancel(reason);
        }
        if let Some(signal) = self.snapshot_signal.take() {
            signal.cancel(reason);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("in_flight", &self.in_flight.as_ref().map(|r| r.id))
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}
