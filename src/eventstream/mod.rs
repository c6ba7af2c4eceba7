pub mod decoder;
pub mod encoder;
pub mod event;

use bytes::Bytes;
use rustc_hash::FxHashMap;

/// Well-known header names carried by upstream frames.
pub const MESSAGE_TYPE_HEADER: &str = ":message-type";
pub const EVENT_TYPE_HEADER: &str = ":event-type";
pub const CONTENT_TYPE_HEADER: &str = ":content-type";
pub const EXCEPTION_TYPE_HEADER: &str = ":exception-type";

/// A decoded header value. Wire tags 0..=9 map onto these variants.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bytes(Vec<u8>),
    String(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Canonical 8-4-4-4-12 lowercase hex rendering.
    Uuid(String),
}

impl HeaderValue {
    /// Textual view for the string-like variants used in routing decisions.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) | HeaderValue::Uuid(s) => Some(s),
            _ => None,
        }
    }
}

/// One decoded EventStream message: headers plus an opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub headers: FxHashMap<String, HeaderValue>,
    pub payload: Bytes,
}

impl Message {
    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }

    /// `:message-type`, defaulting to `event` when absent.
    #[must_use]
    pub fn message_type(&self) -> &str {
        self.header_str(MESSAGE_TYPE_HEADER).unwrap_or("event")
    }

    /// `:event-type`. A frame with an empty header block defaults to
    /// `assistantResponseEvent`: the upstream emits some payload-only frames
    /// without any headers, and treating those as unknown would drop text
    /// deltas. A frame that has headers but no `:event-type` yields `""`.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self.header_str(EVENT_TYPE_HEADER) {
            Some(event_type) => event_type,
            None if self.headers.is_empty() => "assistantResponseEvent",
            None => "",
        }
    }

    /// `:content-type`, defaulting to `application/json`.
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.header_str(CONTENT_TYPE_HEADER)
            .unwrap_or("application/json")
    }

    /// `:exception-type`, when the upstream flags the frame as an exception.
    #[must_use]
    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(EXCEPTION_TYPE_HEADER)
    }
}
