//! Drives the per-stream state machine into Anthropic SSE wire frames.

use smallvec::SmallVec;

use super::state::StreamState;
use super::SseFrame;
use crate::error::ErrorCategory;
use crate::eventstream::event::UpstreamEvent;
use crate::protocol::anthropic::AnthropicStreamEvent;
use crate::protocol::error_shapes::anthropic_error_payload;

pub struct AnthropicStreamEmitter {
    state: StreamState,
    scratch: Vec<AnthropicStreamEvent>,
}

impl AnthropicStreamEmitter {
    #[must_use]
    pub fn new(model: &str, message_id: String, input_tokens: u64) -> Self {
        Self {
            state: StreamState::new(model, message_id, input_tokens),
            scratch: Vec::with_capacity(4),
        }
    }

    /// `message_start` + `ping`, emitted before any upstream bytes arrive.
    pub fn begin(&mut self) -> SmallVec<[SseFrame; 2]> {
        self.scratch.clear();
        self.state.begin(&mut self.scratch);
        self.scratch.iter().map(render).collect()
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> SmallVec<[SseFrame; 2]> {
        self.scratch.clear();
        self.state.on_event(event, &mut self.scratch);
        self.scratch.iter().map(render).collect()
    }

    /// Close open blocks and emit `message_delta` + `message_stop`.
    pub fn finish(&mut self) -> SmallVec<[SseFrame; 2]> {
        self.scratch.clear();
        self.state.finish(&mut self.scratch);
        self.scratch.iter().map(render).collect()
    }

    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        (self.state.input_tokens(), self.state.output_tokens())
    }
}

fn render(event: &AnthropicStreamEvent) -> SseFrame {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseFrame::named(event.event_name(), data)
}

/// The single `error` record sent when the upstream answers non-2xx before
/// any stream content. No `message_start` precedes it.
#[must_use]
pub fn upstream_error_frame(status: u16, message: &str) -> SseFrame {
    let category = crate::error::category_from_upstream_status(status);
    let payload = anthropic_error_payload(category, message);
    SseFrame::named("error", payload.to_string())
}

/// Error record for transport failures mid-stream.
#[must_use]
pub fn transport_error_frame(message: &str) -> SseFrame {
    let payload = anthropic_error_payload(ErrorCategory::ServerError, message);
    SseFrame::named("error", payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_renders_message_start_then_ping() {
        let mut emitter = AnthropicStreamEmitter::new("model-x", "msg_1".to_string(), 12);
        let frames = emitter.begin();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        let body: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(body["message"]["id"], "msg_1");
        assert_eq!(body["message"]["usage"]["input_tokens"], 12);
        assert_eq!(body["message"]["usage"]["output_tokens"], 0);
        assert_eq!(frames[1].event.as_deref(), Some("ping"));
    }

    #[test]
    fn text_delta_renders_wire_shape() {
        let mut emitter = AnthropicStreamEmitter::new("model-x", "msg_1".to_string(), 0);
        emitter.begin();
        let frames = emitter.on_event(&UpstreamEvent::TextDelta {
            content: "hi".to_string(),
        });
        assert_eq!(frames.len(), 2);
        let delta: serde_json::Value = serde_json::from_str(&frames[1].data).unwrap();
        assert_eq!(delta["type"], "content_block_delta");
        assert_eq!(delta["index"], 0);
        assert_eq!(delta["delta"]["type"], "text_delta");
        assert_eq!(delta["delta"]["text"], "hi");
    }

    #[test]
    fn upstream_error_frame_has_no_message_start() {
        let frame = upstream_error_frame(429, "too many requests");
        assert_eq!(frame.event.as_deref(), Some("error"));
        let body: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }
}
