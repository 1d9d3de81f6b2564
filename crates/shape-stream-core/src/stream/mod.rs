//! Shape stream driver
//!
//! [`ShapeStream`] owns one long-poll session: the driver task, the wake
//! detector and the pause coordinator. Lifecycle operations are idempotent:
//! `start` while running never creates a second driver or timer, and
//! `unsubscribe_all` may be called any number of times in any state.

mod driver;
mod state;
mod subscribers;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::{CancelReason, CancelSignal};
use crate::clock::{Clock, SystemClock};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::pause::{PauseCoordinator, PauseTarget};
use crate::protocol::{
    JsonDecoder, MessageDecoder, RequestKind, ShapeParams, ShapeRequest, SnapshotOptions,
    SnapshotResponse,
};
use crate::retry::ErrorHandler;
use crate::transport::Transport;
use crate::wake::{WakeDetector, WakeDetectorStats};

use state::Session;
use subscribers::Subscribers;

pub use state::StreamState;
pub use subscribers::{StreamEvent, Subscription};

/// Page visibility, for hosts that report it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

pub(crate) struct StreamInner {
    id: Uuid,
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn MessageDecoder>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
    subscribers: Arc<Subscribers>,
    wake: WakeDetector,
    pause: PauseCoordinator,
    /// Cuts a pending backoff short after a wake
    wake_notify: Notify,
    /// Cuts a pending backoff short when a snapshot takes or releases the stream
    pause_notify: Notify,
    state_tx: watch::Sender<StreamState>,
    request_ids: AtomicU64,
    weak_self: Weak<StreamInner>,
}

impl StreamInner {
    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_state(&self, session: &mut Session, state: StreamState) {
        if session.state == state {
            return;
        }
        debug!(from = %session.state, to = %state, "ShapeStream: state change");
        session.state = state;
        self.state_tx.send_replace(state);
    }

    /// Arm the wake timer unless it is armed already, a snapshot owns the
    /// stream, or the stream is not running. Takes the session guard so the
    /// check cannot race `suspend`.
    fn arm_if_needed(&self, session: &Session) {
        if !session.state.is_running() || self.pause.is_held() {
            return;
        }
        let weak = self.weak_self.clone();
        self.wake.arm(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_wake();
            }
        });
    }

    /// The host woke up: the in-flight request is presumed dead
    fn handle_wake(&self) {
        {
            let session = self.session.lock();
            match &session.in_flight {
                Some(req) => {
                    req.signal.cancel(CancelReason::SystemWake);
                    info!(
                        stream_id = %self.id,
                        request_id = req.id,
                        issued_at = %req.issued_at,
                        expected_check_at = %req.next_check_at,
                        "ShapeStream: cancelling stale request after wake"
                    );
                }
                None => debug!(stream_id = %self.id, "ShapeStream: wake with no request in flight"),
            }
        }
        self.wake_notify.notify_waiters();
    }

    fn start(&self) {
        let mut session = self.session.lock();
        if session.state.is_running() {
            debug!(generation = session.generation, "ShapeStream: already running");
            self.arm_if_needed(&session);
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        let generation = session.begin_generation();
        self.set_state(&mut session, StreamState::Starting);
        let shutdown = session.shutdown.child_token();
        session.driver = Some(tokio::spawn(driver::run(this, generation, shutdown)));
        info!(stream_id = %self.id, generation, "ShapeStream: started");
        self.arm_if_needed(&session);
    }

    fn teardown(&self) {
        self.subscribers.clear();
        let mut session = self.session.lock();
        session.cancel_all(CancelReason::Stopped);
        self.wake.disarm();
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        if session.state.is_running() {
            session.end_generation();
            self.set_state(&mut session, StreamState::Stopped);
            info!(stream_id = %self.id, "ShapeStream: stopped");
        } else {
            session.shutdown.cancel();
        }
    }

    async fn fetch_snapshot(
        &self,
        options: SnapshotOptions,
    ) -> Result<SnapshotResponse, StreamError> {
        let (request, signal) = {
            let mut session = self.session.lock();
            if session.state == StreamState::Stopped {
                return Err(StreamError::Misuse("request_snapshot on a stopped stream"));
            }
            let signal = CancelSignal::new();
            session.snapshot_signal = Some(signal.clone());
            let request = ShapeRequest {
                id: self.next_request_id(),
                kind: RequestKind::Snapshot(options),
                params: session.params.clone(),
                headers: session.headers.clone(),
                offset: session.cursor.offset().to_string(),
                handle: session.cursor.handle().map(str::to_string),
                live: false,
            };
            (request, signal)
        };

        let request_id = request.id;
        debug!(request_id, "ShapeStream: issuing snapshot request");
        let result = tokio::select! {
            biased;
            reason = signal.cancelled() => Err(StreamError::Cancelled(reason)),
            result = self.transport.fetch(request, signal.clone()) => {
                result.map_err(StreamError::from)
            }
        };
        self.session.lock().snapshot_signal = None;

        let response = result?;
        if !response.is_success() {
            return Err(StreamError::from_response(&response));
        }
        let snapshot = SnapshotResponse::decode(&response)?;
        debug!(request_id, rows = snapshot.data.len(), "ShapeStream: snapshot received");
        self.subscribers
            .emit(&StreamEvent::Snapshot(Arc::new(snapshot.clone())));
        Ok(snapshot)
    }
}

impl PauseTarget for StreamInner {
    fn suspend(&self) {
        let mut session = self.session.lock();
        self.pause.hold();
        if !session.state.is_running() {
            return;
        }
        if let Some(request_id) = session.cancel_in_flight(CancelReason::Paused) {
            debug!(request_id, "ShapeStream: pausing, cancelled in-flight request");
        }
        self.wake.disarm();
        self.set_state(&mut session, StreamState::Paused);
        // A driver sleeping in backoff parks on the pause instead
        self.pause_notify.notify_waiters();
    }

    fn resume(&self) {
        let mut session = self.session.lock();
        self.pause.release();
        // Set only while a snapshot is awaiting its response
        session.snapshot_signal = None;
        if !session.state.is_running() {
            return;
        }
        if session.state == StreamState::Paused {
            self.set_state(&mut session, StreamState::Polling);
        }
        self.arm_if_needed(&session);
        self.pause_notify.notify_waiters();
    }
}

/// Handle to a shape stream
///
/// Clones share the stream. When the last handle is dropped the stream is
/// torn down as if by [`ShapeStream::unsubscribe_all`].
#[derive(Clone)]
pub struct ShapeStream {
    inner: Arc<StreamInner>,
    _teardown: Arc<TeardownOnDrop>,
}

struct TeardownOnDrop(Weak<StreamInner>);

impl Drop for TeardownOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.teardown();
        }
    }
}

impl ShapeStream {
    pub fn builder() -> ShapeStreamBuilder {
        ShapeStreamBuilder::default()
    }

    /// Unique id of this stream, used in logs
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Start polling. Must be called within a tokio runtime.
    ///
    /// Starting a running stream only makes sure the wake timer is armed;
    /// starting a stopped one begins a new generation from the current cursor.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Register a listener; the first one starts the stream
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let (id, first) = self.inner.subscribers.add(Arc::new(callback));
        if first {
            self.inner.start();
        }
        Subscription::new(id, &self.inner.subscribers)
    }

    /// Stop the stream and remove every subscriber
    ///
    /// Cancels the in-flight request and any snapshot with
    /// [`CancelReason::Stopped`] and clears the wake timer. Safe to call in
    /// any state, any number of times.
    pub fn unsubscribe_all(&self) {
        self.inner.teardown();
    }

    /// Fetch a subset of the shape out of band
    ///
    /// The main stream is paused for the duration: its in-flight request is
    /// cancelled and no new one is issued until the snapshot settles. A
    /// second snapshot requested meanwhile waits for the first. The rows are
    /// returned and also delivered to subscribers as [`StreamEvent::Snapshot`].
    pub async fn request_snapshot(
        &self,
        options: SnapshotOptions,
    ) -> Result<SnapshotResponse, StreamError> {
        let inner = self.inner.as_ref();
        inner
            .pause
            .run_exclusive(inner, || inner.fetch_snapshot(options))
            .await
    }

    /// Feed a page-visibility change from the host
    ///
    /// Only meaningful where the host has a visibility API; becoming visible
    /// then plays the role of a wake.
    pub fn notify_visibility(&self, visibility: Visibility) {
        if !self.inner.config.host.has_visibility_api {
            debug!("ShapeStream: visibility change ignored, host has no visibility API");
            return;
        }
        match visibility {
            Visibility::Visible => self.inner.handle_wake(),
            Visibility::Hidden => debug!(stream_id = %self.inner.id, "ShapeStream: hidden"),
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.session.lock().state
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.inner.state_tx.subscribe()
    }

    pub fn wake_stats(&self) -> WakeDetectorStats {
        self.inner.wake.stats()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.inner.session.lock().cursor.is_up_to_date()
    }

    pub fn last_offset(&self) -> String {
        self.inner.session.lock().cursor.offset().to_string()
    }

    pub fn shape_handle(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .cursor
            .handle()
            .map(str::to_string)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Whether a main-stream request is awaiting its response
    pub fn has_request_in_flight(&self) -> bool {
        self.inner.session.lock().in_flight.is_some()
    }
}

impl std::fmt::Debug for ShapeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeStream")
            .field("id", &self.inner.id)
            .field("session", &*self.inner.session.lock())
            .field("wake", &self.inner.wake)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ShapeStream`]
#[derive(Default)]
pub struct ShapeStreamBuilder {
    params: ShapeParams,
    headers: BTreeMap<String, String>,
    config: StreamConfig,
    transport: Option<Arc<dyn Transport>>,
    decoder: Option<Arc<dyn MessageDecoder>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ShapeStreamBuilder {
    /// Shape parameter, e.g. `table`, `where` or `columns`
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(self, transport: impl Transport + 'static) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to [`JsonDecoder`]
    pub fn decoder(mut self, decoder: impl MessageDecoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Recovery hook for terminal errors
    pub fn on_error(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Defaults to [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<ShapeStream, StreamError> {
        let transport = self
            .transport
            .ok_or(StreamError::Misuse("a transport is required"))?;
        self.config
            .validate()
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let wake = WakeDetector::from_config(&self.config, clock.clone())
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        let (state_tx, _) = watch::channel(StreamState::Idle);
        let session = Session::new(self.params, self.headers);

        let inner = Arc::new_cyclic(|weak_self| StreamInner {
            id: Uuid::new_v4(),
            config: self.config,
            transport,
            decoder: self.decoder.unwrap_or_else(|| Arc::new(JsonDecoder)),
            error_handler: self.error_handler,
            clock,
            session: Mutex::new(session),
            subscribers: Arc::new(Subscribers::default()),
            wake,
            pause: PauseCoordinator::new(),
            wake_notify: Notify::new(),
            pause_notify: Notify::new(),
            state_tx,
            request_ids: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        });

        debug!(stream_id = %inner.id, "ShapeStream: built");
        Ok(ShapeStream {
            _teardown: Arc::new(TeardownOnDrop(Arc::downgrade(&inner))),
            inner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TransportError;
    use crate::transport::FnTransport;
    use futures::FutureExt;

    /// Never answers; only a cancel ends the request
    fn hanging_transport() -> Arc<dyn Transport> {
        Arc::new(FnTransport::new(|_req, signal: CancelSignal| {
            async move { Err(TransportError::Aborted(signal.cancelled().await)) }.boxed()
        }))
    }

    fn stream() -> ShapeStream {
        ShapeStream::builder()
            .param("table", "items")
            .shared_transport(hanging_transport())
            .clock(Arc::new(ManualClock::new()))
            .build()
            .unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_build_requires_transport() {
        let err = ShapeStream::builder().build().unwrap_err();
        assert!(matches!(err, StreamError::Misuse(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = StreamConfig {
            poll_interval_ms: 0,
            ..StreamConfig::default()
        };
        let err = ShapeStream::builder()
            .shared_transport(hanging_transport())
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
    }

    #[test]
    fn test_build_rejects_overflowing_wake_threshold() {
        let config = StreamConfig {
            wake_threshold_multiplier: 1e300,
            ..StreamConfig::default()
        };
        let err = ShapeStream::builder()
            .shared_transport(hanging_transport())
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let stream = stream();
        assert_eq!(stream.state(), StreamState::Idle);

        stream.start();
        settle().await;
        assert_eq!(stream.state(), StreamState::Polling);
        assert!(stream.has_request_in_flight());

        stream.start();
        stream.start();
        settle().await;
        let stats = stream.wake_stats();
        assert_eq!(stats.timers_created, 1);
        assert!(stats.active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscriber_starts() {
        let stream = stream();
        let first = stream.subscribe(|_| {});
        let _second = stream.subscribe(|_| {});
        settle().await;
        assert_eq!(stream.state(), StreamState::Polling);
        assert_eq!(stream.subscriber_count(), 2);

        assert!(first.unsubscribe());
        assert_eq!(stream.subscriber_count(), 1);
        assert_eq!(stream.state(), StreamState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_observable() {
        let stream = stream();
        let mut states = stream.state_changes();
        stream.start();
        settle().await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), StreamState::Polling);

        stream.unsubscribe_all();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let stream = stream();
        stream.start();
        settle().await;
        stream.unsubscribe_all();
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(!stream.wake_stats().active);

        stream.start();
        settle().await;
        assert_eq!(stream.state(), StreamState::Polling);
        let stats = stream.wake_stats();
        assert_eq!(stats.timers_created, 2);
        assert_eq!(stats.timers_cleared, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_ignored_without_api() {
        let stream = stream();
        stream.start();
        settle().await;
        stream.notify_visibility(Visibility::Visible);
        settle().await;
        assert_eq!(stream.state(), StreamState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down() {
        let stream = stream();
        let inner = Arc::downgrade(&stream.inner);
        stream.start();
        settle().await;
        let clone = stream.clone();
        drop(stream);
        assert_eq!(clone.state(), StreamState::Polling);

        drop(clone);
        settle().await;
        assert!(inner.upgrade().is_none());
    }
}
