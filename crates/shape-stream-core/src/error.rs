//! Error types for shape streams

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::cancel::CancelReason;
use crate::protocol::{TransportResponse, HANDLE_HEADER, RETRY_AFTER_HEADER};

/// Failure reported by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection-level failure (DNS, refused, reset, TLS, ...)
    #[error("network error: {0}")]
    Network(String),

    /// The transport honoured its cancel signal
    #[error("request aborted ({0})")]
    Aborted(CancelReason),
}

/// Everything that can go wrong with a shape request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    /// The request was cancelled. Never surfaced to subscribers.
    #[error("request cancelled ({0})")]
    Cancelled(CancelReason),

    /// Transient transport failure, retried with backoff
    #[error("network error: {0}")]
    Network(String),

    /// Retryable HTTP status (5xx or 429), retried with backoff
    #[error("server error {status}: {body}")]
    Server {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// 4xx status; terminal unless the recovery hook restarts the stream
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    /// The server rotated the shape (409); the stream restarts from scratch
    #[error("shape must be refetched (handle {handle:?})")]
    MustRefetch { handle: Option<String> },

    /// A successful response could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Retry budget exhausted on a retryable failure
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<StreamError>,
    },

    /// An operation was used in a state where it makes no sense
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// The stream was built with an invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StreamError {
    /// Classify a non-success response by status
    pub fn from_response(response: &TransportResponse) -> Self {
        let status = response.status;
        let body = String::from_utf8_lossy(&response.body).into_owned();
        match status {
            409 => StreamError::MustRefetch {
                handle: response.header(HANDLE_HEADER).map(str::to_string),
            },
            429 | 500..=599 => StreamError::Server {
                status,
                body,
                retry_after: response.header(RETRY_AFTER_HEADER).and_then(parse_retry_after),
            },
            _ => StreamError::Client { status, body },
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            StreamError::Server { status, .. } | StreamError::Client { status, .. } => {
                Some(*status)
            }
            StreamError::MustRefetch { .. } => Some(409),
            StreamError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(msg) => StreamError::Network(msg),
            TransportError::Aborted(reason) => StreamError::Cancelled(reason),
        }
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}
