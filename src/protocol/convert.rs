//! Request and response shape conversion.
//!
//! Inbound, both ingress dialects funnel into the upstream
//! `conversationState` JSON: OpenAI requests are first mapped onto the
//! Anthropic shape, then both share one upstream converter. Outbound, the
//! non-streaming collector output is assembled into either dialect's
//! response body.

use serde_json::{json, Map, Value};

use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicTool,
    AnthropicUsage, MessageContent,
};
use crate::protocol::openai::{
    ChatCompletion, ChatCompletionRequest, ChatFunctionCall, ChatToolCall, ChatUsage,
    CompletionChoice, CompletionMessage,
};
use crate::stream::collector::CollectedOutput;
use crate::stream::state::StopReason;

/// Upstream truncates long tool descriptions anyway; cap them here so the
/// request body stays bounded.
const TOOL_DESCRIPTION_MAX_LEN: usize = 10_000;

/// Filler content for turns the upstream requires but the client omitted.
const EMPTY_TURN: &str = "(empty)";
const CONTINUE_TURN: &str = "Continue";

// ---------------------------------------------------------------------------
// Anthropic -> upstream conversationState
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Turn {
    role: String,
    text: String,
    tool_uses: Vec<Value>,
    tool_results: Vec<Value>,
}

/// Convert an Anthropic request into the upstream `conversationState` body.
#[must_use]
pub fn anthropic_to_upstream(
    request: &AnthropicRequest,
    conversation_id: &str,
    profile_arn: Option<&str>,
) -> Value {
    let model_id = normalize_model_id(&request.model);
    let system_text = request.system.as_ref().map(system_to_text);

    let mut turns = merge_to_alternating(&request.messages);

    if turns.first().map(|t| t.role.as_str()) != Some("user") {
        turns.insert(
            0,
            Turn {
                role: "user".to_string(),
                text: EMPTY_TURN.to_string(),
                ..Turn::default()
            },
        );
    }

    // The upstream requires the system prompt folded into the first user turn.
    if let Some(system) = system_text {
        if !system.is_empty() {
            if let Some(first) = turns.first_mut() {
                first.text = if first.text.is_empty() {
                    system
                } else {
                    format!("{system}\n\n{}", first.text)
                };
            }
        }
    }

    // A trailing assistant turn becomes history; the upstream always speaks
    // to a current user message.
    if turns.last().map(|t| t.role.as_str()) == Some("assistant") {
        turns.push(Turn {
            role: "user".to_string(),
            text: CONTINUE_TURN.to_string(),
            ..Turn::default()
        });
    }

    let current = turns.pop().unwrap_or_else(|| Turn {
        role: "user".to_string(),
        text: CONTINUE_TURN.to_string(),
        ..Turn::default()
    });

    let history: Vec<Value> = turns
        .iter()
        .map(|turn| history_entry(turn, &model_id))
        .collect();

    let mut current_message = json!({
        "content": if current.text.is_empty() { CONTINUE_TURN } else { current.text.as_str() },
        "modelId": model_id,
        "origin": "AI_EDITOR",
    });

    let mut context = Map::new();
    if let Some(tools) = &request.tools {
        let specs = tool_specifications(tools);
        if !specs.is_empty() {
            context.insert("tools".to_string(), Value::Array(specs));
        }
    }
    if !current.tool_results.is_empty() {
        context.insert(
            "toolResults".to_string(),
            Value::Array(current.tool_results),
        );
    }
    if !context.is_empty() {
        current_message["userInputMessageContext"] = Value::Object(context);
    }

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": conversation_id,
        "currentMessage": { "userInputMessage": current_message },
    });
    if !history.is_empty() {
        conversation_state["history"] = Value::Array(history);
    }

    let mut payload = json!({ "conversationState": conversation_state });
    if let Some(arn) = profile_arn {
        payload["profileArn"] = json!(arn);
    }
    payload
}

fn history_entry(turn: &Turn, model_id: &str) -> Value {
    let content = if turn.text.is_empty() {
        EMPTY_TURN
    } else {
        turn.text.as_str()
    };
    if turn.role == "assistant" {
        let mut message = json!({ "content": content });
        if !turn.tool_uses.is_empty() {
            message["toolUses"] = json!(turn.tool_uses);
        }
        json!({ "assistantResponseMessage": message })
    } else {
        let mut message = json!({
            "content": content,
            "modelId": model_id,
            "origin": "AI_EDITOR",
        });
        if !turn.tool_results.is_empty() {
            message["userInputMessageContext"] = json!({ "toolResults": turn.tool_results });
        }
        json!({ "userInputMessage": message })
    }
}

/// Merge consecutive same-role messages into alternating turns, splitting
/// content blocks into text, tool uses, and tool results.
fn merge_to_alternating(messages: &[AnthropicMessage]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();

    for message in messages {
        let (text, tool_uses, tool_results) = split_content(&message.content);

        if let Some(last) = turns.last_mut() {
            if last.role == message.role {
                if !text.is_empty() {
                    if !last.text.is_empty() {
                        last.text.push('\n');
                    }
                    last.text.push_str(&text);
                }
                last.tool_uses.extend(tool_uses);
                last.tool_results.extend(tool_results);
                continue;
            }
        }

        turns.push(Turn {
            role: message.role.clone(),
            text,
            tool_uses,
            tool_results,
        });
    }

    turns
}

fn split_content(content: &MessageContent) -> (String, Vec<Value>, Vec<Value>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_uses = Vec::new();
    let mut tool_results = Vec::new();

    match content {
        MessageContent::Text(text) => text_parts.push(text),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => text_parts.push(text),
                    AnthropicContentBlock::Thinking { thinking } => {
                        if !thinking.is_empty() {
                            text_parts.push(thinking);
                        }
                    }
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        tool_uses.push(json!({
                            "toolUseId": id,
                            "name": name,
                            "input": input,
                        }));
                    }
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let text = tool_result_text(content);
                        let status = if is_error.unwrap_or(false) {
                            "error"
                        } else {
                            "success"
                        };
                        tool_results.push(json!({
                            "toolUseId": tool_use_id,
                            "content": [{ "text": text }],
                            "status": status,
                        }));
                    }
                    AnthropicContentBlock::Image { .. } => {}
                }
            }
        }
    }

    (text_parts.join("\n"), tool_uses, tool_results)
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn system_to_text(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_specifications(tools: &[AnthropicTool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let description = tool.description.as_deref().unwrap_or("");
            let description = truncate_on_char_boundary(description, TOOL_DESCRIPTION_MAX_LEN);
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": { "json": tool.input_schema },
                }
            })
        })
        .collect()
}

fn truncate_on_char_boundary(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Normalise a client-facing model id to the upstream convention:
/// date/`latest` suffixes drop, and a trailing minor version joins the major
/// with a dot (`claude-sonnet-4-5` -> `claude-sonnet-4.5`).
#[must_use]
pub fn normalize_model_id(model: &str) -> String {
    let lower = model.to_lowercase();
    let mut parts: Vec<String> = lower.split('-').map(str::to_string).collect();

    if let Some(last) = parts.last() {
        let is_date = last.len() == 8 && last.chars().all(|c| c.is_ascii_digit());
        if is_date || last == "latest" {
            parts.pop();
        }
    }

    if parts.len() >= 2 {
        let minor = &parts[parts.len() - 1];
        let major = &parts[parts.len() - 2];
        let minor_is_version =
            !minor.is_empty() && minor.len() <= 2 && minor.chars().all(|c| c.is_ascii_digit());
        let major_is_version = !major.is_empty() && major.chars().all(|c| c.is_ascii_digit());
        if minor_is_version && major_is_version {
            let minor = parts.pop().unwrap_or_default();
            let major = parts.pop().unwrap_or_default();
            parts.push(format!("{major}.{minor}"));
        }
    }

    parts.join("-")
}

// ---------------------------------------------------------------------------
// OpenAI -> Anthropic request mapping
// ---------------------------------------------------------------------------

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Map an OpenAI Chat Completions request onto the Anthropic shape so both
/// ingress dialects share the upstream conversion path.
#[must_use]
pub fn openai_to_anthropic(request: &ChatCompletionRequest) -> AnthropicRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = message.content.as_ref().map(content_to_text) {
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
            }
            "tool" => {
                let content = message
                    .content
                    .as_ref()
                    .map(content_to_text)
                    .unwrap_or_default();
                messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: Value::String(content),
                        is_error: None,
                    }]),
                });
            }
            "assistant" => {
                let mut blocks: Vec<AnthropicContentBlock> = Vec::new();
                if let Some(text) = message.content.as_ref().map(content_to_text) {
                    if !text.is_empty() {
                        blocks.push(AnthropicContentBlock::Text { text });
                    }
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(AnthropicContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }
                messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: MessageContent::Blocks(blocks),
                });
            }
            _ => {
                let text = message
                    .content
                    .as_ref()
                    .map(content_to_text)
                    .unwrap_or_default();
                messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: MessageContent::Text(text),
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
            .collect()
    });

    AnthropicRequest {
        model: request.model.clone(),
        max_tokens: request
            .max_completion_tokens
            .or(request.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(Value::String(system_parts.join("\n\n")))
        },
        messages,
        tools,
        tool_choice: request.tool_choice.clone(),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: stop_to_sequences(request.stop.as_ref()),
        extra: Map::new(),
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn stop_to_sequences(stop: Option<&Value>) -> Option<Vec<String>> {
    match stop? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Non-streaming response assembly
// ---------------------------------------------------------------------------

/// Assemble the Anthropic response body from collected output.
#[must_use]
pub fn anthropic_response(
    output: &CollectedOutput,
    model: &str,
    message_id: &str,
    input_tokens: u64,
) -> AnthropicResponse {
    let mut content: Vec<AnthropicContentBlock> = Vec::new();
    if !output.text.is_empty() {
        content.push(AnthropicContentBlock::Text {
            text: output.text.clone(),
        });
    }
    for tool in &output.tool_uses {
        content.push(AnthropicContentBlock::ToolUse {
            id: tool.id.clone(),
            name: tool.name.clone(),
            input: tool.input.clone(),
        });
    }

    AnthropicResponse {
        id: message_id.to_string(),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: Some(output.stop_reason().as_anthropic().to_string()),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens,
            output_tokens: output.estimate_output_tokens(),
        },
    }
}

/// Assemble the OpenAI response body from collected output.
#[must_use]
pub fn chat_completion(
    output: &CollectedOutput,
    model: &str,
    completion_id: &str,
    created: u64,
    input_tokens: u64,
) -> ChatCompletion {
    let tool_calls: Vec<ChatToolCall> = output
        .tool_uses
        .iter()
        .map(|tool| ChatToolCall {
            id: tool.id.clone(),
            type_: "function".to_string(),
            function: ChatFunctionCall {
                name: tool.name.clone(),
                arguments: tool.input.to_string(),
            },
        })
        .collect();

    let finish_reason = match output.stop_reason() {
        StopReason::ToolUse => "tool_calls",
        StopReason::MaxTokens => "length",
        StopReason::EndTurn | StopReason::Error => "stop",
    };

    let output_tokens = output.estimate_output_tokens();
    ChatCompletion {
        id: completion_id.to_string(),
        object: "chat.completion",
        created,
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: CompletionMessage {
                role: "assistant".to_string(),
                content: if output.text.is_empty() {
                    None
                } else {
                    Some(output.text.clone())
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: ChatUsage {
            prompt_tokens: input_tokens,
            completion_tokens: output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
    }
}
