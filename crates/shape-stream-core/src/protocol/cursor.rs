//! Position of a stream within its shape log

use serde_json::Value;

use super::decode::is_up_to_date;
use super::{TransportResponse, HANDLE_HEADER, OFFSET_HEADER, UP_TO_DATE_HEADER};

/// Offset meaning "from the beginning"
pub const INITIAL_OFFSET: &str = "-1";

/// Where the next main-stream request resumes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeCursor {
    offset: String,
    handle: Option<String>,
    up_to_date: bool,
}

impl ShapeCursor {
    pub fn new() -> Self {
        Self {
            offset: INITIAL_OFFSET.to_string(),
            handle: None,
            up_to_date: false,
        }
    }

    pub fn offset(&self) -> &str {
        &self.offset
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    /// Fold a successful response into the cursor
    pub fn advance(&mut self, response: &TransportResponse, messages: &[Value]) {
        if let Some(offset) = response.header(OFFSET_HEADER) {
            self.offset = offset.to_string();
        }
        if let Some(handle) = response.header(HANDLE_HEADER) {
            self.handle = Some(handle.to_string());
        }
        if response.header(UP_TO_DATE_HEADER).is_some() || messages.iter().any(is_up_to_date) {
            self.up_to_date = true;
        }
    }

    /// Start over after the server rotated the shape
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Start over on the handle the server rotated to, if it named one
    pub fn rotate(&mut self, handle: Option<String>) {
        self.reset();
        self.handle = handle;
    }
}

impl Default for ShapeCursor {
    fn default() -> Self {
        Self::new()
    }
}
