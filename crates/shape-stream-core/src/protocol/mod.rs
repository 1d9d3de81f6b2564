//! Shape protocol types
//!
//! Request descriptors handed to the transport, the responses it returns,
//! and the cursor that carries offset/handle between requests.

mod cursor;
mod decode;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use cursor::{ShapeCursor, INITIAL_OFFSET};
pub use decode::{is_up_to_date, JsonDecoder, MessageDecoder, SnapshotResponse};

/// Response header carrying the offset to resume from
pub const OFFSET_HEADER: &str = "electric-offset";
/// Response header carrying the shape handle
pub const HANDLE_HEADER: &str = "electric-handle";
/// Response header present once the client has caught up
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";
/// Response header carrying the shape schema
pub const SCHEMA_HEADER: &str = "electric-schema";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Shape parameters (`table`, `where`, `columns`, ...)
pub type ShapeParams = BTreeMap<String, String>;

/// What a request is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Main-stream long-poll request
    Stream,
    /// Out-of-band snapshot of a subset of the shape
    Snapshot(SnapshotOptions),
}

/// Subset selection for a snapshot request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order_by: Option<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
}

impl SnapshotOptions {
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(("subset__limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("subset__offset".to_string(), offset.to_string()));
        }
        if let Some(order_by) = &self.order_by {
            pairs.push(("subset__order_by".to_string(), order_by.clone()));
        }
        if let Some(where_clause) = &self.where_clause {
            pairs.push(("subset__where".to_string(), where_clause.clone()));
        }
        pairs
    }
}

/// Request descriptor handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    /// Unique per stream; lets logs and tests tell requests apart
    pub id: u64,
    pub kind: RequestKind,
    pub params: ShapeParams,
    pub headers: BTreeMap<String, String>,
    pub offset: String,
    pub handle: Option<String>,
    /// Long-poll for live changes (set once the stream is up to date)
    pub live: bool,
}

impl ShapeRequest {
    pub fn is_snapshot(&self) -> bool {
        matches!(self.kind, RequestKind::Snapshot(_))
    }

    /// Query string pairs in a stable order
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        pairs.push(("offset".to_string(), self.offset.clone()));
        if let Some(handle) = &self.handle {
            pairs.push(("handle".to_string(), handle.clone()));
        }

        match &self.kind {
            RequestKind::Stream if self.live => {
                pairs.push(("live".to_string(), "true".to_string()));
            }
            RequestKind::Stream => {}
            RequestKind::Snapshot(options) => pairs.extend(options.query_pairs()),
        }

        pairs
    }
}

/// Minimal HTTP-like response returned by a transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are stored lowercase
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k == &lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
