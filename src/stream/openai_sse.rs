//! Projects upstream events into OpenAI `chat.completion.chunk` SSE records.
//!
//! The projection is flatter than the Anthropic grammar: one role chunk up
//! front, content and tool-call argument deltas in the middle, a terminal
//! finish-reason chunk, then the literal `[DONE]` sentinel. Block stops are
//! not projected.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::state::{stop_reason_for_exception, StopReason};
use super::{done_frame, SseFrame};
use crate::error::ErrorCategory;
use crate::eventstream::event::{InputFragment, UpstreamEvent};
use crate::observability::token_estimator::{estimate_text_tokens, TOOL_USE_BLOCK_TOKENS};
use crate::protocol::error_shapes::openai_error_payload;
use crate::protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionDelta, ToolCallDelta,
};

pub struct OpenAiStreamProjector {
    chunk_id: String,
    created: u64,
    model: String,
    /// Dense 0..N tool indices in upstream arrival order.
    tool_index_by_tool_use_id: FxHashMap<String, usize>,
    saw_tool_use: bool,
    forced_stop: Option<StopReason>,
    finished: bool,
    terminate: bool,
    output_tokens: u64,
}

impl OpenAiStreamProjector {
    #[must_use]
    pub fn new(model: &str, chunk_id: String, created: u64) -> Self {
        Self {
            chunk_id,
            created,
            model: model.to_string(),
            tool_index_by_tool_use_id: FxHashMap::default(),
            saw_tool_use: false,
            forced_stop: None,
            finished: false,
            terminate: false,
            output_tokens: 0,
        }
    }

    /// Estimated output tokens over everything projected so far, floored at
    /// one once tool activity appeared.
    #[must_use]
    pub fn output_tokens(&self) -> u64 {
        if self.saw_tool_use {
            self.output_tokens.max(1)
        } else {
            self.output_tokens
        }
    }

    /// The initial role chunk.
    pub fn begin(&mut self) -> SmallVec<[SseFrame; 2]> {
        let mut out = SmallVec::new();
        out.push(self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                ..ChunkDelta::default()
            },
            None,
        ));
        out
    }

    /// Once set, the caller must stop reading the upstream body; the
    /// projector's output is already complete.
    #[must_use]
    pub fn should_terminate(&self) -> bool {
        self.terminate
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> SmallVec<[SseFrame; 2]> {
        let mut out = SmallVec::new();
        if self.finished {
            return out;
        }
        match event {
            UpstreamEvent::TextDelta { content } => {
                if !content.is_empty() {
                    self.output_tokens += estimate_text_tokens(content);
                    out.push(self.chunk(
                        ChunkDelta {
                            content: Some(content.clone()),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
            UpstreamEvent::ToolUseStart { tool_use_id, name } => {
                if self.tool_index_by_tool_use_id.contains_key(tool_use_id) {
                    return out;
                }
                let index = self.tool_index_by_tool_use_id.len();
                self.tool_index_by_tool_use_id
                    .insert(tool_use_id.clone(), index);
                self.saw_tool_use = true;
                self.output_tokens += TOOL_USE_BLOCK_TOKENS + estimate_text_tokens(name);
                out.push(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: Some(tool_use_id.clone()),
                            type_: Some("function".to_string()),
                            function: FunctionDelta {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            },
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            UpstreamEvent::ToolUseDelta { tool_use_id, input } => {
                let Some(&index) = self.tool_index_by_tool_use_id.get(tool_use_id) else {
                    return out;
                };
                let arguments = match input {
                    InputFragment::Text(text) => text.clone(),
                    InputFragment::Object(value) => value.to_string(),
                };
                if arguments.is_empty() {
                    return out;
                }
                self.output_tokens += estimate_text_tokens(&arguments);
                out.push(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: None,
                            type_: None,
                            function: FunctionDelta {
                                name: None,
                                arguments: Some(arguments),
                            },
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            // Block stops are not projected.
            UpstreamEvent::ToolUseStop { .. } => {}
            UpstreamEvent::Exception { exception_type } => {
                tracing::warn!(exception_type, "upstream exception under OpenAI projection");
                let reason = stop_reason_for_exception(exception_type);
                self.forced_stop = Some(reason);
                if reason == StopReason::MaxTokens {
                    // Length truncation terminates the projection immediately;
                    // remaining upstream bytes are not read.
                    self.terminate = true;
                    out.extend(self.finish());
                }
            }
            UpstreamEvent::Metadata { .. } | UpstreamEvent::Unknown => {}
        }
        out
    }

    /// Terminal finish-reason chunk followed by `[DONE]`. Idempotent: once
    /// finished (including via early termination) this returns nothing.
    pub fn finish(&mut self) -> SmallVec<[SseFrame; 2]> {
        let mut out = SmallVec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        let stop = self.forced_stop.unwrap_or(if self.saw_tool_use {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        if stop == StopReason::Error {
            let payload =
                openai_error_payload(ErrorCategory::ServerError, "upstream exception");
            out.push(SseFrame::data_only(payload.to_string()));
        }
        out.push(self.chunk(ChunkDelta::default(), Some(stop.as_openai_finish())));
        out.push(done_frame());
        out
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> SseFrame {
        let chunk = ChatCompletionChunk::new(
            &self.chunk_id,
            self.created,
            &self.model,
            ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            },
        );
        let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
        SseFrame::data_only(data)
    }
}

/// Single error record for upstream non-2xx before any content, OpenAI shape.
#[must_use]
pub fn upstream_error_frame(status: u16, message: &str) -> SseFrame {
    let category = crate::error::category_from_upstream_status(status);
    SseFrame::data_only(openai_error_payload(category, message).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &SseFrame) -> serde_json::Value {
        serde_json::from_str(&frame.data).unwrap()
    }

    #[test]
    fn begin_emits_role_chunk() {
        let mut projector = OpenAiStreamProjector::new("gpt-x", "chatcmpl-1".to_string(), 7);
        let frames = projector.begin();
        assert_eq!(frames.len(), 1);
        let body = parse(&frames[0]);
        assert_eq!(body["object"], "chat.completion.chunk");
        assert_eq!(body["choices"][0]["delta"]["role"], "assistant");
        assert!(body["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn tool_calls_use_dense_indices() {
        let mut projector = OpenAiStreamProjector::new("gpt-x", "c1".to_string(), 0);
        projector.begin();
        let first = projector.on_event(&UpstreamEvent::ToolUseStart {
            tool_use_id: "t-a".to_string(),
            name: "alpha".to_string(),
        });
        let second = projector.on_event(&UpstreamEvent::ToolUseStart {
            tool_use_id: "t-b".to_string(),
            name: "beta".to_string(),
        });
        assert_eq!(
            parse(&first[0])["choices"][0]["delta"]["tool_calls"][0]["index"],
            0
        );
        assert_eq!(
            parse(&second[0])["choices"][0]["delta"]["tool_calls"][0]["index"],
            1
        );
        let args = projector.on_event(&UpstreamEvent::ToolUseDelta {
            tool_use_id: "t-b".to_string(),
            input: InputFragment::Text("{\"q\":1}".to_string()),
        });
        let call = &parse(&args[0])["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 1);
        assert_eq!(call["function"]["arguments"], "{\"q\":1}");
        assert!(call.get("id").is_none());
    }

    #[test]
    fn finish_reports_tool_calls_when_tools_were_seen() {
        let mut projector = OpenAiStreamProjector::new("gpt-x", "c1".to_string(), 0);
        projector.begin();
        projector.on_event(&UpstreamEvent::ToolUseStart {
            tool_use_id: "t1".to_string(),
            name: "calc".to_string(),
        });
        let frames = projector.finish();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            parse(&frames[0])["choices"][0]["finish_reason"],
            "tool_calls"
        );
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn length_exception_terminates_immediately() {
        let mut projector = OpenAiStreamProjector::new("gpt-x", "c1".to_string(), 0);
        projector.begin();
        projector.on_event(&UpstreamEvent::TextDelta {
            content: "partial ".to_string(),
        });
        let frames = projector.on_event(&UpstreamEvent::Exception {
            exception_type: "ContentLengthExceededException".to_string(),
        });
        assert!(projector.should_terminate());
        assert_eq!(parse(&frames[0])["choices"][0]["finish_reason"], "length");
        assert_eq!(frames[1].data, "[DONE]");
        // Later events and finish() are no-ops.
        assert!(projector
            .on_event(&UpstreamEvent::TextDelta {
                content: "ignored".to_string()
            })
            .is_empty());
        assert!(projector.finish().is_empty());
    }

    #[test]
    fn non_length_exception_adds_error_chunk() {
        let mut projector = OpenAiStreamProjector::new("gpt-x", "c1".to_string(), 0);
        projector.begin();
        projector.on_event(&UpstreamEvent::Exception {
            exception_type: "InternalServerException".to_string(),
        });
        let frames = projector.finish();
        assert_eq!(frames.len(), 3);
        assert!(parse(&frames[0]).get("error").is_some());
        assert_eq!(parse(&frames[1])["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames[2].data, "[DONE]");
    }

    #[test]
    fn tool_stop_is_not_projected() {
        let mut projector = OpenAiStreamProjector::new("gpt-x", "c1".to_string(), 0);
        projector.begin();
        projector.on_event(&UpstreamEvent::ToolUseStart {
            tool_use_id: "t1".to_string(),
            name: "calc".to_string(),
        });
        let frames = projector.on_event(&UpstreamEvent::ToolUseStop {
            tool_use_id: "t1".to_string(),
        });
        assert!(frames.is_empty());
    }
}
