//! Classification of decoded frames into typed upstream events.
//!
//! Payload JSON is heterogeneous; events are recognised by field presence
//! rather than a schema. Payloads that fail to parse classify as
//! [`UpstreamEvent::Unknown`] so a single bad frame never kills the stream.

use serde_json::Value;
use smallvec::SmallVec;

use super::Message;

/// A typed upstream event derived from one frame's payload.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta {
        content: String,
    },
    ToolUseStart {
        tool_use_id: String,
        name: String,
    },
    ToolUseDelta {
        tool_use_id: String,
        input: InputFragment,
    },
    ToolUseStop {
        tool_use_id: String,
    },
    Exception {
        exception_type: String,
    },
    Metadata {
        conversation_id: Option<String>,
    },
    Unknown,
}

/// A streamed tool-input fragment. String fragments concatenate; an object
/// replaces everything accumulated so far.
#[derive(Debug, Clone, PartialEq)]
pub enum InputFragment {
    Text(String),
    Object(Value),
}

/// Per-stream event interpreter.
///
/// Stateful only to remember dropped tool ids: a `web_search` tool-use start
/// is swallowed here, and its later deltas and stop (which carry only the id)
/// must be swallowed with it.
#[derive(Default)]
pub struct EventInterpreter {
    dropped_tool_ids: rustc_hash::FxHashSet<String>,
}

impl EventInterpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one decoded message into zero or more logical events.
    ///
    /// A single upstream frame may fuse tool start, input fragment, and stop;
    /// the fused form is split into the logical sequence here so the state
    /// machines downstream only see one transition per event.
    pub fn interpret(&mut self, message: &Message) -> SmallVec<[UpstreamEvent; 2]> {
        let mut out = SmallVec::new();

        if message.message_type() == "exception" {
            out.push(UpstreamEvent::Exception {
                exception_type: exception_type_of(message),
            });
            return out;
        }

        let payload: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!("non-JSON payload treated as unknown event: {err}");
                out.push(UpstreamEvent::Unknown);
                return out;
            }
        };

        // An assistantResponseEvent wrapper object, when present, is the event.
        let event = payload.get("assistantResponseEvent").unwrap_or(&payload);

        if let Some(content) = event.get("content").and_then(Value::as_str) {
            out.push(UpstreamEvent::TextDelta {
                content: content.to_string(),
            });
            return out;
        }

        if let Some(tool_use_id) = event.get("toolUseId").and_then(Value::as_str) {
            if self.interpret_tool_event(event, tool_use_id, &mut out) {
                return out;
            }
        }

        if let Some(exception_type) = event
            .get("exception_type")
            .or_else(|| event.get("__type"))
            .and_then(Value::as_str)
        {
            out.push(UpstreamEvent::Exception {
                exception_type: exception_type.to_string(),
            });
            return out;
        }

        if let Some(conversation_id) = event.get("conversationId") {
            out.push(UpstreamEvent::Metadata {
                conversation_id: conversation_id.as_str().map(str::to_string),
            });
            return out;
        }

        out.push(UpstreamEvent::Unknown);
        out
    }

    /// Returns `true` when the payload was a tool event (even if every piece
    /// of it was swallowed for a dropped tool), so the caller stops matching.
    fn interpret_tool_event(
        &mut self,
        event: &Value,
        tool_use_id: &str,
        out: &mut SmallVec<[UpstreamEvent; 2]>,
    ) -> bool {
        let name = event.get("name").and_then(Value::as_str);
        let stop = event.get("stop").and_then(Value::as_bool).unwrap_or(false);
        let mut handled = name.is_some() || stop;

        if let Some(name) = name {
            if is_dropped_tool(name) {
                tracing::debug!(tool = name, "dropping unsupported tool use");
                self.dropped_tool_ids.insert(tool_use_id.to_string());
            } else {
                out.push(UpstreamEvent::ToolUseStart {
                    tool_use_id: tool_use_id.to_string(),
                    name: name.to_string(),
                });
            }
        }

        let dropped = self.dropped_tool_ids.contains(tool_use_id);

        if let Some(input) = event.get("input") {
            let fragment = match input {
                Value::String(text) => Some(InputFragment::Text(text.clone())),
                Value::Object(_) => Some(InputFragment::Object(input.clone())),
                _ => None,
            };
            if let Some(input) = fragment {
                handled = true;
                if !dropped {
                    out.push(UpstreamEvent::ToolUseDelta {
                        tool_use_id: tool_use_id.to_string(),
                        input,
                    });
                }
            }
        }

        if stop {
            if dropped {
                self.dropped_tool_ids.remove(tool_use_id);
            } else {
                out.push(UpstreamEvent::ToolUseStop {
                    tool_use_id: tool_use_id.to_string(),
                });
            }
        }

        handled || dropped
    }
}

fn is_dropped_tool(name: &str) -> bool {
    name.eq_ignore_ascii_case("web_search") || name.eq_ignore_ascii_case("websearch")
}

fn exception_type_of(message: &Message) -> String {
    if let Some(exception_type) = message.exception_type() {
        return exception_type.to_string();
    }
    serde_json::from_slice::<Value>(&message.payload)
        .ok()
        .and_then(|payload| {
            payload
                .get("__type")
                .or_else(|| payload.get("exception_type"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "UnknownException".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rustc_hash::FxHashMap;

    fn message(payload: &str) -> Message {
        Message {
            headers: FxHashMap::default(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    #[test]
    fn classifies_text_delta() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message(r#"{"content":"hello"}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::TextDelta {
                content: "hello".to_string()
            }]
        );
    }

    #[test]
    fn unwraps_assistant_response_event() {
        let mut interp = EventInterpreter::new();
        let events =
            interp.interpret(&message(r#"{"assistantResponseEvent":{"content":"hi"}}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::TextDelta {
                content: "hi".to_string()
            }]
        );
    }

    #[test]
    fn splits_fused_start_and_delta() {
        let mut interp = EventInterpreter::new();
        let events =
            interp.interpret(&message(r#"{"toolUseId":"t1","name":"calc","input":""}"#));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            UpstreamEvent::ToolUseStart {
                tool_use_id: "t1".to_string(),
                name: "calc".to_string()
            }
        );
        assert_eq!(
            events[1],
            UpstreamEvent::ToolUseDelta {
                tool_use_id: "t1".to_string(),
                input: InputFragment::Text(String::new())
            }
        );
    }

    #[test]
    fn classifies_delta_without_name() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message(r#"{"toolUseId":"t1","input":"{\"x\":"}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::ToolUseDelta {
                tool_use_id: "t1".to_string(),
                input: InputFragment::Text("{\"x\":".to_string())
            }]
        );
    }

    #[test]
    fn object_input_becomes_object_fragment() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message(r#"{"toolUseId":"t1","input":{"x":1}}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::ToolUseDelta {
                tool_use_id: "t1".to_string(),
                input: InputFragment::Object(serde_json::json!({"x":1}))
            }]
        );
    }

    #[test]
    fn classifies_tool_stop() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message(r#"{"toolUseId":"t1","stop":true}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::ToolUseStop {
                tool_use_id: "t1".to_string()
            }]
        );
    }

    #[test]
    fn classifies_exception_from_dunder_type() {
        let mut interp = EventInterpreter::new();
        let events =
            interp.interpret(&message(r#"{"__type":"ContentLengthExceededException"}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::Exception {
                exception_type: "ContentLengthExceededException".to_string()
            }]
        );
    }

    #[test]
    fn classifies_metadata() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message(r#"{"conversationId":"c-123"}"#));
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::Metadata {
                conversation_id: Some("c-123".to_string())
            }]
        );
    }

    #[test]
    fn non_json_payload_is_unknown() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message("not json at all"));
        assert_eq!(events.as_slice(), [UpstreamEvent::Unknown]);
    }

    #[test]
    fn unrecognised_object_is_unknown() {
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message(r#"{"somethingElse":42}"#));
        assert_eq!(events.as_slice(), [UpstreamEvent::Unknown]);
    }

    #[test]
    fn web_search_tool_is_dropped_with_its_deltas_and_stop() {
        let mut interp = EventInterpreter::new();
        let start =
            interp.interpret(&message(r#"{"toolUseId":"w1","name":"web_search"}"#));
        assert!(start.is_empty());
        let delta = interp.interpret(&message(r#"{"toolUseId":"w1","input":"{}"}"#));
        assert!(delta.is_empty());
        let stop = interp.interpret(&message(r#"{"toolUseId":"w1","stop":true}"#));
        assert!(stop.is_empty());
        // Once stopped, the id is forgotten.
        let other = interp.interpret(&message(r#"{"toolUseId":"t2","name":"calc"}"#));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn exception_header_wins_over_payload() {
        let mut headers = FxHashMap::default();
        headers.insert(
            crate::eventstream::MESSAGE_TYPE_HEADER.to_string(),
            crate::eventstream::HeaderValue::String("exception".to_string()),
        );
        headers.insert(
            crate::eventstream::EXCEPTION_TYPE_HEADER.to_string(),
            crate::eventstream::HeaderValue::String("ThrottlingException".to_string()),
        );
        let message = Message {
            headers,
            payload: Bytes::from_static(b"{\"message\":\"slow down\"}"),
        };
        let mut interp = EventInterpreter::new();
        let events = interp.interpret(&message);
        assert_eq!(
            events.as_slice(),
            [UpstreamEvent::Exception {
                exception_type: "ThrottlingException".to_string()
            }]
        );
    }
}
