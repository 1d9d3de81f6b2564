//! The poll loop
//!
//! One driver task runs per generation. Each iteration issues exactly one
//! main-stream request, waits for it (or for its cancellation), and then
//! either dispatches the decoded messages or asks the retry policy what to do.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{InFlight, StreamState};
use super::subscribers::StreamEvent;
use super::StreamInner;
use crate::cancel::{CancelReason, CancelSignal};
use crate::error::StreamError;
use crate::protocol::{RequestKind, ShapeRequest, TransportResponse};
use crate::retry::{RetryDecision, RetryPolicy};

/// Result of trying to issue the next request
enum Issue {
    Sent(ShapeRequest, CancelSignal),
    /// A snapshot owns the stream
    Paused,
    /// The generation is over
    Finished,
}

pub(crate) async fn run(inner: Arc<StreamInner>, generation: u64, shutdown: CancellationToken) {
    let mut policy = RetryPolicy::new(inner.config.retry.clone());
    info!(stream_id = %inner.id, generation, "ShapeStream: driver started");

    loop {
        let (request, signal) = match inner.issue(generation) {
            Issue::Sent(request, signal) => (request, signal),
            Issue::Paused => {
                debug!(generation, "ShapeStream: paused, waiting for snapshot");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = inner.pause.wait_released() => continue,
                }
            }
            Issue::Finished => break,
        };

        let request_id = request.id;
        let outcome = tokio::select! {
            biased;
            reason = signal.cancelled() => Err(StreamError::Cancelled(reason)),
            result = inner.transport.fetch(request, signal.clone()) => {
                result.map_err(StreamError::from)
            }
        };

        if !inner.session.lock().settle(generation, request_id) {
            debug!(generation, request_id, "ShapeStream: discarding stale response");
            break;
        }

        let error = match outcome {
            Ok(response) if response.is_success() => {
                match inner.apply_response(generation, &response) {
                    Ok(()) => {
                        policy.record_success();
                        continue;
                    }
                    Err(err) => err,
                }
            }
            Ok(response) => StreamError::from_response(&response),
            Err(err) => err,
        };

        if let StreamError::Cancelled(reason) = &error {
            if *reason == CancelReason::Stopped {
                break;
            }
            debug!(generation, request_id, reason = %reason, "ShapeStream: request cancelled, reissuing");
        }

        let rotated_handle = match &error {
            StreamError::MustRefetch { handle } => Some(handle.clone()),
            _ => None,
        };

        match policy.decide(error) {
            RetryDecision::Reissue => {}
            RetryDecision::Refetch => {
                inner.refetch(generation, rotated_handle.flatten());
            }
            RetryDecision::Backoff(delay) => {
                warn!(
                    generation,
                    request_id,
                    delay_ms = delay.as_millis() as u64,
                    "ShapeStream: request failed, backing off"
                );
                let woke = inner.wake_notify.notified();
                let paused = inner.pause_notify.notified();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = woke => debug!(generation, "ShapeStream: backoff cut short by wake"),
                    _ = paused => debug!(generation, "ShapeStream: backoff cut short by snapshot"),
                }
            }
            RetryDecision::Terminal(error) => {
                if !inner.recover_or_stop(generation, error).await {
                    break;
                }
            }
        }
    }

    debug!(stream_id = %inner.id, generation, "ShapeStream: driver exited");
}

impl StreamInner {
    fn issue(&self, generation: u64) -> Issue {
        let mut session = self.session.lock();
        if !session.is_current(generation) || !session.state.is_running() {
            return Issue::Finished;
        }
        // Checked under the session lock, which `suspend` also takes
        if self.pause.is_held() {
            return Issue::Paused;
        }

        let record = InFlight::new(
            self.next_request_id(),
            self.clock.now(),
            self.config.poll_interval(),
        );
        let request = ShapeRequest {
            id: record.id,
            kind: RequestKind::Stream,
            params: session.params.clone(),
            headers: session.headers.clone(),
            offset: session.cursor.offset().to_string(),
            handle: session.cursor.handle().map(str::to_string),
            live: session.cursor.is_up_to_date(),
        };
        let signal = record.signal.clone();
        debug!(
            generation,
            request_id = record.id,
            offset = %request.offset,
            live = request.live,
            "ShapeStream: issuing request"
        );
        session.in_flight = Some(record);

        if session.state == StreamState::Starting {
            self.set_state(&mut session, StreamState::Polling);
        }
        Issue::Sent(request, signal)
    }

    fn apply_response(
        &self,
        generation: u64,
        response: &TransportResponse,
    ) -> Result<(), StreamError> {
        let messages = self.decoder.decode(response)?;
        {
            let mut session = self.session.lock();
            if !session.is_current(generation) {
                return Ok(());
            }
            session.cursor.advance(response, &messages);
        }
        if !messages.is_empty() {
            debug!(generation, count = messages.len(), "ShapeStream: dispatching messages");
            self.subscribers
                .emit(&StreamEvent::Messages(Arc::new(messages)));
        }
        Ok(())
    }

    fn refetch(&self, generation: u64, handle: Option<String>) {
        {
            let mut session = self.session.lock();
            if !session.is_current(generation) {
                return;
            }
            session.cursor.rotate(handle);
        }
        warn!(generation, "ShapeStream: shape rotated, refetching from scratch");
        self.subscribers.emit(&StreamEvent::MustRefetch);
    }

    /// Give the recovery hook a chance. Returns true if the loop continues.
    async fn recover_or_stop(&self, generation: u64, error: StreamError) -> bool {
        let recovery = match &self.error_handler {
            Some(handler) => handler.on_error(&error).await,
            None => None,
        };

        let Some(recovery) = recovery else {
            self.fail(generation, error);
            return false;
        };

        let mut session = self.session.lock();
        if !session.is_current(generation) {
            return false;
        }
        session.params.extend(recovery.params);
        session.headers.extend(recovery.headers);
        info!(generation, error = %error, "ShapeStream: recovered, restarting in place");
        // Same generation and driver; only the wake timer is (re)checked
        self.arm_if_needed(&session);
        true
    }

    fn fail(&self, generation: u64, error: StreamError) {
        {
            let mut session = self.session.lock();
            if !session.is_current(generation) {
                return;
            }
            session.end_generation();
            session.driver = None;
            self.wake.disarm();
            self.set_state(&mut session, StreamState::Stopped);
        }
        error!(stream_id = %self.id, generation, error = %error, "ShapeStream: stopped on error");
        self.subscribers.emit(&StreamEvent::Error(Arc::new(error)));
    }
}
