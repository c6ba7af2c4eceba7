//! Per-stream state machine for the Anthropic SSE event grammar.
//!
//! ```text
//! message_start
//! (ping)
//! (content_block_start i (content_block_delta i)* content_block_stop i)*
//! message_delta
//! message_stop
//! ```
//!
//! Every candidate event passes through [`StreamState::push_valid`], which
//! drops anything that would violate the grammar, so downstream writers can
//! trust the sequence unconditionally.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::eventstream::event::{InputFragment, UpstreamEvent};
use crate::observability::token_estimator::{
    estimate_text_tokens, TOOL_USE_BLOCK_TOKENS,
};
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicDeltaUsage, AnthropicMessageDeltaBody,
    AnthropicMessageStart, AnthropicStreamEvent, AnthropicUsage,
};

/// Resolved stop reason for a finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

impl StopReason {
    #[must_use]
    pub fn as_anthropic(self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Error => "error",
        }
    }

    /// OpenAI `finish_reason` projection. `Error` maps to `stop`; the
    /// projector emits a separate error chunk alongside it.
    #[must_use]
    pub fn as_openai_finish(self) -> &'static str {
        match self {
            StopReason::EndTurn | StopReason::Error => "stop",
            StopReason::ToolUse => "tool_calls",
            StopReason::MaxTokens => "length",
        }
    }
}

/// Classify an upstream exception kind into a forced stop reason.
#[must_use]
pub fn stop_reason_for_exception(exception_type: &str) -> StopReason {
    if exception_type.contains("ContentLengthExceeds") {
        StopReason::MaxTokens
    } else {
        StopReason::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPhase {
    Open,
    Stopped,
}

/// Index of the lazily opened text content block.
const TEXT_BLOCK_INDEX: usize = 0;

pub struct StreamState {
    message_id: String,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    message_started: bool,
    message_delta_sent: bool,
    message_stopped: bool,
    blocks: FxHashMap<usize, BlockPhase>,
    tool_use_id_by_index: FxHashMap<usize, String>,
    index_by_tool_use_id: FxHashMap<String, usize>,
    completed_tool_use_ids: FxHashSet<String>,
    /// Tool blocks take indices 1.. and never reuse one within a stream.
    next_tool_index: usize,
    forced_stop: Option<StopReason>,
    any_block_opened: bool,
}

impl StreamState {
    #[must_use]
    pub fn new(model: &str, message_id: String, input_tokens: u64) -> Self {
        Self {
            message_id,
            model: model.to_string(),
            input_tokens,
            output_tokens: 0,
            message_started: false,
            message_delta_sent: false,
            message_stopped: false,
            blocks: FxHashMap::default(),
            tool_use_id_by_index: FxHashMap::default(),
            index_by_tool_use_id: FxHashMap::default(),
            completed_tool_use_ids: FxHashSet::default(),
            next_tool_index: TEXT_BLOCK_INDEX + 1,
            forced_stop: None,
            any_block_opened: false,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    #[must_use]
    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    /// Emit `message_start` and the initial `ping`.
    pub fn begin(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        let start = AnthropicStreamEvent::MessageStart {
            message: AnthropicMessageStart {
                id: self.message_id.clone(),
                type_: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: vec![],
                stop_reason: None,
                usage: AnthropicUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            },
        };
        self.push_valid(out, start);
        self.push_valid(out, AnthropicStreamEvent::Ping {});
    }

    /// Translate one upstream event into zero or more client events.
    pub fn on_event(&mut self, event: &UpstreamEvent, out: &mut Vec<AnthropicStreamEvent>) {
        match event {
            UpstreamEvent::TextDelta { content } => self.on_text_delta(content, out),
            UpstreamEvent::ToolUseStart { tool_use_id, name } => {
                self.on_tool_start(tool_use_id, name, out);
            }
            UpstreamEvent::ToolUseDelta { tool_use_id, input } => {
                self.on_tool_delta(tool_use_id, input, out);
            }
            UpstreamEvent::ToolUseStop { tool_use_id } => self.on_tool_stop(tool_use_id, out),
            UpstreamEvent::Exception { exception_type } => {
                tracing::warn!(exception_type, "upstream exception event");
                self.forced_stop = Some(stop_reason_for_exception(exception_type));
            }
            UpstreamEvent::Metadata { conversation_id } => {
                if let Some(id) = conversation_id {
                    tracing::debug!(conversation_id = id.as_str(), "upstream metadata");
                }
            }
            UpstreamEvent::Unknown => {}
        }
    }

    /// Close open blocks in ascending index order, then emit the terminal
    /// `message_delta` + `message_stop`.
    pub fn finish(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        let mut open: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, phase)| **phase == BlockPhase::Open)
            .map(|(index, _)| *index)
            .collect();
        open.sort_unstable();
        for index in open {
            // Active tools at end of stream complete implicitly.
            if let Some(tool_use_id) = self.tool_use_id_by_index.get(&index).cloned() {
                self.completed_tool_use_ids.insert(tool_use_id.clone());
                self.index_by_tool_use_id.remove(&tool_use_id);
                self.tool_use_id_by_index.remove(&index);
            }
            self.push_valid(out, AnthropicStreamEvent::ContentBlockStop { index });
        }

        let stop_reason = self.resolve_stop_reason();
        let output_tokens = if self.any_block_opened {
            self.output_tokens.max(1)
        } else {
            self.output_tokens
        };
        self.output_tokens = output_tokens;

        self.push_valid(
            out,
            AnthropicStreamEvent::MessageDelta {
                delta: AnthropicMessageDeltaBody {
                    stop_reason: Some(stop_reason.as_anthropic().to_string()),
                    stop_sequence: None,
                },
                usage: AnthropicDeltaUsage { output_tokens },
            },
        );
        self.push_valid(out, AnthropicStreamEvent::MessageStop {});
    }

    /// Select the stop reason from the observed signals. An exception always
    /// wins over tool activity; truncation signalling is load-bearing for
    /// clients.
    #[must_use]
    pub fn resolve_stop_reason(&self) -> StopReason {
        if let Some(forced) = self.forced_stop {
            return forced;
        }
        if !self.completed_tool_use_ids.is_empty() || !self.index_by_tool_use_id.is_empty() {
            return StopReason::ToolUse;
        }
        StopReason::EndTurn
    }

    #[must_use]
    pub fn has_tool_activity(&self) -> bool {
        !self.completed_tool_use_ids.is_empty() || !self.index_by_tool_use_id.is_empty()
    }

    #[must_use]
    pub fn forced_stop(&self) -> Option<StopReason> {
        self.forced_stop
    }

    fn on_text_delta(&mut self, content: &str, out: &mut Vec<AnthropicStreamEvent>) {
        if content.is_empty() {
            return;
        }
        if self.blocks.get(&TEXT_BLOCK_INDEX).is_none() {
            self.push_valid(
                out,
                AnthropicStreamEvent::ContentBlockStart {
                    index: TEXT_BLOCK_INDEX,
                    content_block: AnthropicContentBlock::Text {
                        text: String::new(),
                    },
                },
            );
        }
        self.output_tokens += estimate_text_tokens(content);
        self.push_valid(
            out,
            AnthropicStreamEvent::ContentBlockDelta {
                index: TEXT_BLOCK_INDEX,
                delta: AnthropicDelta::TextDelta {
                    text: content.to_string(),
                },
            },
        );
    }

    fn on_tool_start(
        &mut self,
        tool_use_id: &str,
        name: &str,
        out: &mut Vec<AnthropicStreamEvent>,
    ) {
        if self.index_by_tool_use_id.contains_key(tool_use_id)
            || self.completed_tool_use_ids.contains(tool_use_id)
        {
            tracing::debug!(tool_use_id, "duplicate tool_use start ignored");
            return;
        }
        let index = self.next_tool_index;
        self.next_tool_index += 1;
        self.index_by_tool_use_id
            .insert(tool_use_id.to_string(), index);
        self.tool_use_id_by_index
            .insert(index, tool_use_id.to_string());
        self.output_tokens += TOOL_USE_BLOCK_TOKENS + estimate_text_tokens(name);
        self.push_valid(
            out,
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: AnthropicContentBlock::ToolUse {
                    id: tool_use_id.to_string(),
                    name: name.to_string(),
                    input: serde_json::json!({}),
                },
            },
        );
    }

    fn on_tool_delta(
        &mut self,
        tool_use_id: &str,
        input: &InputFragment,
        out: &mut Vec<AnthropicStreamEvent>,
    ) {
        if self.completed_tool_use_ids.contains(tool_use_id) {
            tracing::debug!(tool_use_id, "input delta for completed tool ignored");
            return;
        }
        // Delta before start: synthesise the start with an unknown name.
        if !self.index_by_tool_use_id.contains_key(tool_use_id) {
            self.on_tool_start(tool_use_id, "", out);
        }
        let Some(&index) = self.index_by_tool_use_id.get(tool_use_id) else {
            return;
        };
        let partial_json = match input {
            InputFragment::Text(text) => text.clone(),
            InputFragment::Object(value) => value.to_string(),
        };
        if partial_json.is_empty() {
            return;
        }
        self.output_tokens += estimate_text_tokens(&partial_json);
        self.push_valid(
            out,
            AnthropicStreamEvent::ContentBlockDelta {
                index,
                delta: AnthropicDelta::InputJsonDelta { partial_json },
            },
        );
    }

    fn on_tool_stop(&mut self, tool_use_id: &str, out: &mut Vec<AnthropicStreamEvent>) {
        let Some(&index) = self.index_by_tool_use_id.get(tool_use_id) else {
            tracing::debug!(tool_use_id, "stop for unknown tool ignored");
            return;
        };
        self.push_valid(out, AnthropicStreamEvent::ContentBlockStop { index });
        // Record completion before dropping the active mapping.
        self.completed_tool_use_ids.insert(tool_use_id.to_string());
        self.index_by_tool_use_id.remove(tool_use_id);
        self.tool_use_id_by_index.remove(&index);
    }

    /// Grammar gate. Updates block bookkeeping for accepted events and drops
    /// (with a debug log) anything out of order.
    fn push_valid(&mut self, out: &mut Vec<AnthropicStreamEvent>, event: AnthropicStreamEvent) {
        let accepted = match &event {
            AnthropicStreamEvent::MessageStart { .. } => {
                if self.message_started {
                    false
                } else {
                    self.message_started = true;
                    true
                }
            }
            AnthropicStreamEvent::Ping {} => self.message_started && !self.message_stopped,
            AnthropicStreamEvent::ContentBlockStart { index, .. } => {
                if self.message_started
                    && !self.message_delta_sent
                    && !self.blocks.contains_key(index)
                {
                    self.blocks.insert(*index, BlockPhase::Open);
                    self.any_block_opened = true;
                    true
                } else {
                    false
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { index, .. } => {
                self.blocks.get(index) == Some(&BlockPhase::Open)
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if self.blocks.get(index) == Some(&BlockPhase::Open) {
                    self.blocks.insert(*index, BlockPhase::Stopped);
                    true
                } else {
                    false
                }
            }
            AnthropicStreamEvent::MessageDelta { .. } => {
                let all_closed = self
                    .blocks
                    .values()
                    .all(|phase| *phase == BlockPhase::Stopped);
                if self.message_started && !self.message_delta_sent && all_closed {
                    self.message_delta_sent = true;
                    true
                } else {
                    false
                }
            }
            AnthropicStreamEvent::MessageStop {} => {
                if self.message_delta_sent && !self.message_stopped {
                    self.message_stopped = true;
                    true
                } else {
                    false
                }
            }
            AnthropicStreamEvent::Error { .. } => true,
        };

        if accepted {
            out.push(event);
        } else {
            tracing::debug!(event = event.event_name(), "dropped out-of-order event");
        }
    }
}
