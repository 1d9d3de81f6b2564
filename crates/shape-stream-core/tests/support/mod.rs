//! Shared fixtures for stream integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shape_stream_core::{
    CancelReason, CancelSignal, ManualClock, ShapeRequest, ShapeStream, ShapeStreamBuilder,
    StreamConfig, StreamEvent, Transport, TransportError, TransportResponse,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How the scripted transport answers one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Wait until cancelled
    Hang,
    Respond(TransportResponse),
    /// Respond after a delay unless cancelled first
    Delayed(Duration, TransportResponse),
    Fail(TransportError),
}

/// One request seen by the transport
#[derive(Debug, Clone)]
pub struct Recorded {
    pub request: ShapeRequest,
    pub signal: CancelSignal,
    pub at: Instant,
}

impl Recorded {
    pub fn reason(&self) -> Option<CancelReason> {
        self.signal.reason()
    }
}

/// Records every request and answers from a script
///
/// Main-stream requests pop the script, falling back to `fallback` once it is
/// empty. Snapshot requests always get `snapshot_reply`.
pub struct ScriptedTransport {
    log: Mutex<Vec<Recorded>>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    snapshot_reply: Mutex<Reply>,
}

impl ScriptedTransport {
    pub fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback,
            snapshot_reply: Mutex::new(Reply::Respond(snapshot_body())),
        })
    }

    /// Every main-stream request hangs until cancelled
    pub fn hanging() -> Arc<Self> {
        Self::new(Reply::Hang)
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn set_snapshot_reply(&self, reply: Reply) {
        *self.snapshot_reply.lock() = reply;
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    pub fn main_requests(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| !r.request.is_snapshot())
            .collect()
    }

    pub fn snapshot_requests(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.request.is_snapshot())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        request: ShapeRequest,
        signal: CancelSignal,
    ) -> Result<TransportResponse, TransportError> {
        let reply = if request.is_snapshot() {
            self.snapshot_reply.lock().clone()
        } else {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        };
        self.log.lock().push(Recorded {
            request,
            signal: signal.clone(),
            at: Instant::now(),
        });

        match reply {
            Reply::Hang => Err(TransportError::Aborted(signal.cancelled().await)),
            Reply::Respond(response) => Ok(response),
            Reply::Delayed(delay, response) => {
                tokio::select! {
                    reason = signal.cancelled() => Err(TransportError::Aborted(reason)),
                    _ = tokio::time::sleep(delay) => Ok(response),
                }
            }
            Reply::Fail(err) => Err(err),
        }
    }
}

pub fn ok(body: &str) -> TransportResponse {
    TransportResponse::new(200)
        .with_header("electric-offset", "0_0")
        .with_header("electric-handle", "h1")
        .with_body(body.to_string())
}

pub fn status(code: u16, body: &str) -> TransportResponse {
    TransportResponse::new(code).with_body(body.to_string())
}

pub fn snapshot_body() -> TransportResponse {
    TransportResponse::new(200)
        .with_header("electric-offset", "0_0")
        .with_header("electric-handle", "h1")
        .with_header("electric-schema", "{}")
        .with_body(
            r#"{"metadata":{"snapshot_mark":1,"xmin":"0","xmax":"0","xip_list":[],"database_lsn":"0"},"data":[]}"#,
        )
}

/// Builder with a `table` param, the scripted transport and a manual clock
pub fn builder(transport: &Arc<ScriptedTransport>, clock: &Arc<ManualClock>) -> ShapeStreamBuilder {
    ShapeStream::builder()
        .param("table", "foo")
        .shared_transport(transport.clone())
        .clock(clock.clone())
        .config(StreamConfig::default())
}

/// Collects every event a subscriber sees
#[derive(Default, Clone)]
pub struct EventLog(Arc<Mutex<Vec<StreamEvent>>>);

impl EventLog {
    pub fn callback(&self) -> impl Fn(&StreamEvent) + Send + Sync + 'static {
        let events = self.0.clone();
        move |event: &StreamEvent| events.lock().push(event.clone())
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.0.lock().clone()
    }

    pub fn errors(&self) -> Vec<StreamEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, StreamEvent::Error(_)))
            .collect()
    }
}

/// Let spawned tasks run without moving paused time
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Advance paused time, then let everything it woke run
pub async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}
