//! Cancellation support for shape requests
//!
//! Every request handed to a transport carries a [`CancelSignal`]. Cancelling
//! it records a [`CancelReason`] first, so whoever observes the cancellation
//! can also tell why it happened.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    /// The stream was stopped or torn down
    Stopped,
    /// A snapshot request took exclusive ownership of the stream
    Paused,
    /// The host slept and the request is presumed stale
    SystemWake,
}

impl CancelReason {
    /// Stable wire value, e.g. `"system-wake"`
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Stopped => "stopped",
            CancelReason::Paused => "paused",
            CancelReason::SystemWake => "system-wake",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation signal handed to the transport with each request
///
/// Clones share state. The first reason passed to [`CancelSignal::cancel`]
/// wins; later calls are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with a reason. Returns false if already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason this signal was cancelled with, if it was
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Wait until cancelled and return the reason
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        // The reason is always stored before the token fires
        self.reason().unwrap_or(CancelReason::Stopped)
    }
}
