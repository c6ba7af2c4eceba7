//! Deterministic token accountancy for client-visible `usage` fields.
//!
//! The upstream reports no token counts, so the gateway estimates with a
//! `ceil(chars / 4)` text heuristic plus flat structural surcharges per block
//! kind. The numbers are not real tokenisation; they are monotone and cheap.

use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicRequest, AnthropicTool, MessageContent,
};
use serde_json::Value;

/// Structural surcharge for a tool-use block (id, name framing).
pub const TOOL_USE_BLOCK_TOKENS: u64 = 12;
/// Structural surcharge for a tool-result block.
pub const TOOL_RESULT_BLOCK_TOKENS: u64 = 10;
/// Structural surcharge for a tool definition.
pub const TOOL_DEFINITION_TOKENS: u64 = 20;
/// Structural surcharge per message envelope.
pub const MESSAGE_TOKENS: u64 = 4;

/// `ceil(chars / 4)` for plain text.
#[must_use]
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Tokens for an arbitrary JSON value rendered compactly.
#[must_use]
pub fn estimate_json_tokens(value: &Value) -> u64 {
    match value {
        Value::String(text) => estimate_text_tokens(text),
        other => estimate_text_tokens(&other.to_string()),
    }
}

/// Estimate the total input tokens for an Anthropic request: system prompt,
/// message content (recursively), and tool definitions.
#[must_use]
pub fn estimate_request_tokens(request: &AnthropicRequest) -> u64 {
    let mut total: u64 = 0;

    if let Some(system) = &request.system {
        total += estimate_system_tokens(system);
    }

    for message in &request.messages {
        total += MESSAGE_TOKENS;
        total += estimate_content_tokens(&message.content);
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            total += estimate_tool_definition_tokens(tool);
        }
    }

    total
}

fn estimate_system_tokens(system: &Value) -> u64 {
    match system {
        Value::String(text) => estimate_text_tokens(text),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| {
                block
                    .get("text")
                    .and_then(Value::as_str)
                    .map_or(0, estimate_text_tokens)
            })
            .sum(),
        _ => 0,
    }
}

fn estimate_content_tokens(content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => estimate_text_tokens(text),
        MessageContent::Blocks(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
    }
}

fn estimate_block_tokens(block: &AnthropicContentBlock) -> u64 {
    match block {
        AnthropicContentBlock::Text { text } | AnthropicContentBlock::Thinking { thinking: text } => {
            estimate_text_tokens(text)
        }
        AnthropicContentBlock::ToolUse { name, input, .. } => {
            TOOL_USE_BLOCK_TOKENS + estimate_text_tokens(name) + estimate_json_tokens(input)
        }
        AnthropicContentBlock::ToolResult { content, .. } => {
            TOOL_RESULT_BLOCK_TOKENS + estimate_tool_result_tokens(content)
        }
        AnthropicContentBlock::Image { .. } => 0,
    }
}

fn estimate_tool_result_tokens(content: &Value) -> u64 {
    match content {
        Value::String(text) => estimate_text_tokens(text),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.get("text")
                    .and_then(Value::as_str)
                    .map_or(0, estimate_text_tokens)
            })
            .sum(),
        other => estimate_json_tokens(other),
    }
}

fn estimate_tool_definition_tokens(tool: &AnthropicTool) -> u64 {
    let schema = serde_json::to_string(&tool.input_schema).unwrap_or_default();
    TOOL_DEFINITION_TOKENS
        + estimate_text_tokens(&tool.name)
        + tool
            .description
            .as_deref()
            .map_or(0, estimate_text_tokens)
        + estimate_text_tokens(&schema)
}
