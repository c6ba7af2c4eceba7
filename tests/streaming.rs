//! End-to-end streaming scenarios: encoded upstream frames pushed through
//! the decoder, interpreter, and both emitters, asserting the client-visible
//! SSE sequences.

use serde_json::{json, Value};
use streamgate::eventstream::decoder::FrameDecoder;
use streamgate::eventstream::encoder::encode_event;
use streamgate::eventstream::event::EventInterpreter;
use streamgate::stream::anthropic_sse::AnthropicStreamEmitter;
use streamgate::stream::openai_sse::OpenAiStreamProjector;
use streamgate::stream::SseFrame;

fn wire(payloads: &[Value]) -> Vec<u8> {
    let mut stream = Vec::new();
    for payload in payloads {
        stream.extend_from_slice(&encode_event("assistantResponseEvent", payload));
    }
    stream
}

/// Run the upstream bytes through the full Anthropic pipeline in fixed-size
/// chunks, returning every SSE frame in order.
fn run_anthropic(bytes: &[u8], chunk_size: usize) -> Vec<SseFrame> {
    let mut decoder = FrameDecoder::new();
    let mut interpreter = EventInterpreter::new();
    let mut emitter = AnthropicStreamEmitter::new("model-x", "msg_t1".to_string(), 9);

    let mut frames: Vec<SseFrame> = emitter.begin().into_iter().collect();
    let mut messages = Vec::new();
    for chunk in bytes.chunks(chunk_size.max(1)) {
        messages.clear();
        decoder.feed(chunk, &mut messages).unwrap();
        for message in &messages {
            for event in interpreter.interpret(message) {
                frames.extend(emitter.on_event(&event));
            }
        }
    }
    frames.extend(emitter.finish());
    frames
}

fn run_openai(bytes: &[u8]) -> Vec<SseFrame> {
    let mut decoder = FrameDecoder::new();
    let mut interpreter = EventInterpreter::new();
    let mut projector = OpenAiStreamProjector::new("model-x", "chatcmpl-t1".to_string(), 1);

    let mut frames: Vec<SseFrame> = projector.begin().into_iter().collect();
    let mut messages = Vec::new();
    for chunk in bytes.chunks(7) {
        messages.clear();
        decoder.feed(chunk, &mut messages).unwrap();
        for message in &messages {
            for event in interpreter.interpret(message) {
                frames.extend(projector.on_event(&event));
                if projector.should_terminate() {
                    return frames;
                }
            }
        }
    }
    frames.extend(projector.finish());
    frames
}

fn event_names(frames: &[SseFrame]) -> Vec<String> {
    frames
        .iter()
        .map(|f| f.event.clone().unwrap_or_else(|| "<data>".to_string()))
        .collect()
}

fn data(frame: &SseFrame) -> Value {
    serde_json::from_str(&frame.data).unwrap()
}

#[test]
fn plain_text_stream_produces_canonical_sequence() {
    let bytes = wire(&[json!({"content": "hi"}), json!({"content": " there"})]);
    let frames = run_anthropic(&bytes, 1024);

    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let start = data(&frames[0]);
    assert_eq!(start["message"]["role"], "assistant");
    assert_eq!(start["message"]["model"], "model-x");
    assert_eq!(start["message"]["content"], json!([]));
    assert!(start["message"]["stop_reason"].is_null());
    assert_eq!(start["message"]["usage"]["input_tokens"], 9);
    assert_eq!(start["message"]["usage"]["output_tokens"], 0);

    let block_start = data(&frames[2]);
    assert_eq!(block_start["index"], 0);
    assert_eq!(block_start["content_block"]["type"], "text");
    assert_eq!(block_start["content_block"]["text"], "");

    assert_eq!(data(&frames[3])["delta"]["text"], "hi");
    assert_eq!(data(&frames[4])["delta"]["text"], " there");
    assert_eq!(data(&frames[5])["index"], 0);

    let message_delta = data(&frames[6]);
    assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
    assert!(message_delta["delta"]["stop_sequence"].is_null());
    let output_tokens = message_delta["usage"]["output_tokens"].as_u64().unwrap();
    assert!(output_tokens >= 1);
}

#[test]
fn byte_chunking_does_not_change_the_sequence() {
    let bytes = wire(&[
        json!({"content": "alpha"}),
        json!({"toolUseId": "t1", "name": "calc", "input": ""}),
        json!({"toolUseId": "t1", "input": "{\"x\":1}"}),
        json!({"toolUseId": "t1", "stop": true}),
    ]);
    let whole = run_anthropic(&bytes, bytes.len());
    for chunk_size in [1, 2, 5, 13] {
        assert_eq!(run_anthropic(&bytes, chunk_size), whole, "chunk={chunk_size}");
    }
}

#[test]
fn tool_call_stream_projects_tool_use_block() {
    let bytes = wire(&[
        json!({"toolUseId": "t1", "name": "calc", "input": ""}),
        json!({"toolUseId": "t1", "input": "{\"x\":"}),
        json!({"toolUseId": "t1", "input": "1}"}),
        json!({"toolUseId": "t1", "stop": true}),
    ]);
    let frames = run_anthropic(&bytes, 64);

    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let block_start = data(&frames[2]);
    assert_eq!(block_start["index"], 1);
    assert_eq!(block_start["content_block"]["type"], "tool_use");
    assert_eq!(block_start["content_block"]["id"], "t1");
    assert_eq!(block_start["content_block"]["name"], "calc");
    assert_eq!(block_start["content_block"]["input"], json!({}));

    let first_delta = data(&frames[3]);
    assert_eq!(first_delta["index"], 1);
    assert_eq!(first_delta["delta"]["type"], "input_json_delta");
    assert_eq!(first_delta["delta"]["partial_json"], "{\"x\":");
    assert_eq!(data(&frames[4])["delta"]["partial_json"], "1}");

    assert_eq!(data(&frames[5])["index"], 1);
    assert_eq!(data(&frames[6])["delta"]["stop_reason"], "tool_use");
}

#[test]
fn every_content_block_stop_has_a_prior_start() {
    let bytes = wire(&[
        json!({"content": "intro"}),
        json!({"toolUseId": "a", "name": "one"}),
        json!({"toolUseId": "b", "name": "two"}),
        json!({"toolUseId": "a", "stop": true}),
        // "b" never stops; finish() must close it.
    ]);
    let frames = run_anthropic(&bytes, 32);

    let mut open = std::collections::HashSet::new();
    let mut message_delta_seen = false;
    for frame in &frames {
        let body = data(frame);
        match body["type"].as_str().unwrap() {
            "content_block_start" => {
                assert!(!message_delta_seen);
                assert!(open.insert(body["index"].as_u64().unwrap()));
            }
            "content_block_stop" => {
                assert!(open.remove(&body["index"].as_u64().unwrap()));
            }
            "message_delta" => {
                assert!(open.is_empty(), "message_delta before blocks closed");
                message_delta_seen = true;
            }
            _ => {}
        }
    }
    assert!(message_delta_seen);
    assert_eq!(frames.last().unwrap().event.as_deref(), Some("message_stop"));
}

#[test]
fn resynced_garbage_still_yields_both_deltas() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&encode_event(
        "assistantResponseEvent",
        &json!({"content": "a"}),
    ));
    bytes.push(0xFF);
    bytes.extend_from_slice(&encode_event(
        "assistantResponseEvent",
        &json!({"content": "b"}),
    ));

    let frames = run_anthropic(&bytes, 1024);
    let texts: Vec<String> = frames
        .iter()
        .filter(|f| f.event.as_deref() == Some("content_block_delta"))
        .map(|f| data(f)["delta"]["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// OpenAI projection
// ---------------------------------------------------------------------------

#[test]
fn openai_projection_of_text_stream() {
    let bytes = wire(&[json!({"content": "hello"})]);
    let frames = run_openai(&bytes);

    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|f| f.event.is_none()));
    assert_eq!(data(&frames[0])["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(data(&frames[1])["choices"][0]["delta"]["content"], "hello");
    assert_eq!(data(&frames[2])["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[3].data, "[DONE]");
}

#[test]
fn length_exception_truncates_openai_projection() {
    // S3: text, then the length exception, then bytes that must not matter.
    let mut bytes = wire(&[
        json!({"content": "partial "}),
        json!({"__type": "ContentLengthExceededException"}),
    ]);
    let with_tail = {
        let mut extended = bytes.clone();
        extended.extend_from_slice(&wire(&[json!({"content": "IGNORED"})]));
        extended
    };

    let truncated = run_openai(&bytes);
    let with_tail_frames = run_openai(&with_tail);
    assert_eq!(truncated, with_tail_frames);

    assert_eq!(
        data(&truncated[1])["choices"][0]["delta"]["content"],
        "partial "
    );
    assert_eq!(
        data(&truncated[2])["choices"][0]["finish_reason"],
        "length"
    );
    assert_eq!(truncated.last().unwrap().data, "[DONE]");

    bytes.clear();
    bytes.extend_from_slice(&wire(&[json!({"content": "after"})]));
    // A fresh pipeline still works; termination state is per stream.
    assert_eq!(run_openai(&bytes).len(), 4);
}

#[test]
fn openai_tool_calls_round_trip_through_projection() {
    let bytes = wire(&[
        json!({"toolUseId": "t1", "name": "lookup"}),
        json!({"toolUseId": "t1", "input": "{\"q\":\"hi\"}"}),
        json!({"toolUseId": "t1", "stop": true}),
    ]);
    let frames = run_openai(&bytes);

    let tool_start = data(&frames[1]);
    let call = &tool_start["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["index"], 0);
    assert_eq!(call["id"], "t1");
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "lookup");
    assert_eq!(call["function"]["arguments"], "");

    let args = data(&frames[2]);
    assert_eq!(
        args["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        "{\"q\":\"hi\"}"
    );

    assert_eq!(
        data(&frames[3])["choices"][0]["finish_reason"],
        "tool_calls"
    );
    assert_eq!(frames.last().unwrap().data, "[DONE]");
}
