//! Drains a complete upstream byte stream into accumulated text and
//! reassembled tool uses for non-streaming responses.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::state::{stop_reason_for_exception, StopReason};
use crate::error::GatewayError;
use crate::eventstream::decoder::FrameDecoder;
use crate::eventstream::event::{EventInterpreter, InputFragment, UpstreamEvent};
use crate::observability::token_estimator::{
    estimate_json_tokens, estimate_text_tokens, TOOL_USE_BLOCK_TOKENS,
};

/// One fully reassembled tool use.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Result of draining one upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedOutput {
    pub text: String,
    pub tool_uses: Vec<CollectedToolUse>,
    /// Forced by an upstream exception, when one was observed.
    pub forced_stop: Option<StopReason>,
}

impl CollectedOutput {
    /// Final stop reason: a forced reason wins, then tool activity, then a
    /// clean end of turn.
    #[must_use]
    pub fn stop_reason(&self) -> StopReason {
        if let Some(forced) = self.forced_stop {
            return forced;
        }
        if self.tool_uses.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        }
    }

    /// Output-token estimate over the accumulated content.
    #[must_use]
    pub fn estimate_output_tokens(&self) -> u64 {
        let mut total = estimate_text_tokens(&self.text);
        for tool in &self.tool_uses {
            total += TOOL_USE_BLOCK_TOKENS
                + estimate_text_tokens(&tool.name)
                + estimate_json_tokens(&tool.input);
        }
        if !self.tool_uses.is_empty() {
            total = total.max(1);
        }
        total
    }
}

/// Accumulates events from a complete response.
#[derive(Default)]
pub struct NonStreamCollector {
    text: String,
    tool_order: Vec<String>,
    tools: FxHashMap<String, CollectedToolUse>,
    input_buffers: FxHashMap<String, String>,
    forced_stop: Option<StopReason>,
}

impl NonStreamCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) {
        match event {
            UpstreamEvent::TextDelta { content } => self.text.push_str(content),
            UpstreamEvent::ToolUseStart { tool_use_id, name } => {
                if !self.tools.contains_key(tool_use_id) {
                    self.tool_order.push(tool_use_id.clone());
                    self.tools.insert(
                        tool_use_id.clone(),
                        CollectedToolUse {
                            id: tool_use_id.clone(),
                            name: name.clone(),
                            input: Value::Object(serde_json::Map::new()),
                        },
                    );
                }
            }
            UpstreamEvent::ToolUseDelta { tool_use_id, input } => {
                self.ensure_tool(tool_use_id);
                match input {
                    // An object fragment replaces everything accumulated.
                    InputFragment::Object(value) => {
                        self.input_buffers.remove(tool_use_id);
                        if let Some(tool) = self.tools.get_mut(tool_use_id) {
                            tool.input = value.clone();
                        }
                    }
                    InputFragment::Text(text) => {
                        self.input_buffers
                            .entry(tool_use_id.clone())
                            .or_default()
                            .push_str(text);
                    }
                }
            }
            UpstreamEvent::ToolUseStop { tool_use_id } => self.flush_input(tool_use_id),
            UpstreamEvent::Exception { exception_type } => {
                tracing::warn!(exception_type, "upstream exception while collecting");
                self.forced_stop = Some(stop_reason_for_exception(exception_type));
            }
            UpstreamEvent::Metadata { .. } | UpstreamEvent::Unknown => {}
        }
    }

    /// Flush dangling input buffers (tools that never saw a stop) and return
    /// the accumulated output.
    #[must_use]
    pub fn finish(mut self) -> CollectedOutput {
        let dangling: Vec<String> = self.input_buffers.keys().cloned().collect();
        for tool_use_id in dangling {
            self.flush_input(&tool_use_id);
        }
        let tools = &mut self.tools;
        let tool_uses = self
            .tool_order
            .iter()
            .filter_map(|id| tools.remove(id))
            .collect();
        CollectedOutput {
            text: self.text,
            tool_uses,
            forced_stop: self.forced_stop,
        }
    }

    fn ensure_tool(&mut self, tool_use_id: &str) {
        if !self.tools.contains_key(tool_use_id) {
            self.on_event(&UpstreamEvent::ToolUseStart {
                tool_use_id: tool_use_id.to_string(),
                name: String::new(),
            });
        }
    }

    /// Single parse attempt over the concatenated fragments. Malformed JSON
    /// leaves the input as an empty object.
    fn flush_input(&mut self, tool_use_id: &str) {
        let Some(buffer) = self.input_buffers.remove(tool_use_id) else {
            return;
        };
        if buffer.trim().is_empty() {
            return;
        }
        let Some(tool) = self.tools.get_mut(tool_use_id) else {
            return;
        };
        match serde_json::from_str::<Value>(&buffer) {
            Ok(value) => tool.input = value,
            Err(err) => {
                tracing::warn!(tool_use_id, "tool input JSON parse failed: {err}");
                tool.input = Value::Object(serde_json::Map::new());
            }
        }
    }
}

/// Drain a complete upstream byte stream through the frame decoder and event
/// interpreter.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] when the frame decoder exhausts its
/// error budget, and [`GatewayError::Transport`] when the byte stream itself
/// fails.
pub async fn collect_stream<S, E>(byte_stream: S) -> Result<CollectedOutput, GatewayError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut decoder = FrameDecoder::new();
    let mut interpreter = EventInterpreter::new();
    let mut collector = NonStreamCollector::new();
    let mut messages = Vec::new();

    futures_util::pin_mut!(byte_stream);
    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|err| {
            GatewayError::Transport(format!("upstream body read failed: {err}"))
        })?;
        messages.clear();
        decoder.feed(&chunk, &mut messages).map_err(|err| {
            GatewayError::Upstream {
                status: 502,
                message: err.to_string(),
            }
        })?;
        for message in &messages {
            for event in interpreter.interpret(message) {
                collector.on_event(&event);
            }
        }
    }

    Ok(collector.finish())
}
