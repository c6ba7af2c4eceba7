pub mod anthropic_sse;
pub mod collector;
pub mod openai_sse;
pub mod state;

/// One SSE record ready for the wire: optional `event:` name plus a JSON
/// (or `[DONE]`) data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    #[must_use]
    pub fn named(event: &str, data: String) -> Self {
        Self {
            event: Some(event.to_string()),
            data,
        }
    }

    #[must_use]
    pub fn data_only(data: String) -> Self {
        Self { event: None, data }
    }

    /// Render as `event: {event}\ndata: {data}\n\n` (or just the data record
    /// when unnamed, OpenAI style).
    #[must_use]
    pub fn to_sse_string(&self) -> String {
        match self.event.as_deref() {
            Some(event) => {
                let mut out = String::with_capacity(16 + event.len() + self.data.len());
                out.push_str("event: ");
                out.push_str(event);
                out.push('\n');
                out.push_str("data: ");
                out.push_str(&self.data);
                out.push_str("\n\n");
                out
            }
            None => {
                let mut out = String::with_capacity(10 + self.data.len());
                out.push_str("data: ");
                out.push_str(&self.data);
                out.push_str("\n\n");
                out
            }
        }
    }
}

/// The OpenAI terminal sentinel record.
#[must_use]
pub fn done_frame() -> SseFrame {
    SseFrame::data_only("[DONE]".to_string())
}

/// Concatenate rendered frames into one wire buffer.
#[must_use]
pub fn frames_to_bytes(frames: &[SseFrame]) -> bytes::Bytes {
    let mut out = String::new();
    for frame in frames {
        out.push_str(&frame.to_sse_string());
    }
    bytes::Bytes::from(out)
}
