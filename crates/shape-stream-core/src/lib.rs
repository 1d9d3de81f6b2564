//! Core library for shape-stream
//!
//! A long-polling client for change-data-capture shape streams that keeps
//! working when the host sleeps, when snapshot requests interrupt the main
//! stream, and when errors force an in-place restart.
//!
//! Key components:
//! - `stream` - the [`ShapeStream`] driver: poll loop, lifecycle, subscribers
//! - `wake` - wall-clock gap detection that invalidates stale requests
//! - `pause` - exclusive pause/resume around out-of-band snapshot requests
//! - `retry` - failure classification, backoff and the recovery hook
//! - `cancel` - cancellation signals carrying a typed reason
//! - `protocol` - request descriptors, responses, cursor and decoding
//! - `transport` - the pluggable fetch seam plus a reqwest implementation

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod pause;
pub mod protocol;
pub mod retry;
pub mod stream;
pub mod transport;
pub mod wake;

pub use cancel::{CancelReason, CancelSignal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HostCapabilities, StreamConfig};
pub use error::{ConfigError, StreamError, TransportError};
pub use protocol::{
    JsonDecoder, MessageDecoder, RequestKind, ShapeParams, ShapeRequest, SnapshotOptions,
    SnapshotResponse, TransportResponse,
};
pub use retry::{ErrorHandler, Recovery, RetryConfig};
pub use stream::{
    ShapeStream, ShapeStreamBuilder, StreamEvent, StreamState, Subscription, Visibility,
};
pub use transport::{FnTransport, HttpTransport, Transport};
pub use wake::{WakeDetector, WakeDetectorStats};
