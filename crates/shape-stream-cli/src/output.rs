//! JSON-lines rendering of stream events

use serde_json::{json, Value};
use shape_stream_core::StreamEvent;

/// Lines to print for one event; one per message or snapshot row
pub fn render(event: &StreamEvent) -> Vec<String> {
    match event {
        StreamEvent::Messages(messages) => messages.iter().map(Value::to_string).collect(),
        StreamEvent::Snapshot(snapshot) => snapshot
            .data
            .iter()
            .map(|row| json!({ "snapshot": row }).to_string())
            .collect(),
        StreamEvent::MustRefetch => vec![json!({ "control": "must-refetch" }).to_string()],
        StreamEvent::Error(err) => {
            vec![json!({ "error": err.to_string(), "status": err.status() }).to_string()]
        }
    }
}
