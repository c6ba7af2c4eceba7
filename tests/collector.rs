//! Non-stream drain scenarios over real encoded frames.

use bytes::Bytes;
use serde_json::json;
use streamgate::eventstream::encoder::encode_event;
use streamgate::stream::collector::collect_stream;
use streamgate::stream::state::StopReason;

fn wire(payloads: &[serde_json::Value]) -> Vec<u8> {
    let mut stream = Vec::new();
    for payload in payloads {
        stream.extend_from_slice(&encode_event("assistantResponseEvent", payload));
    }
    stream
}

async fn collect(bytes: Vec<u8>, chunk_size: usize) -> streamgate::stream::collector::CollectedOutput {
    let chunks: Vec<Result<Bytes, std::convert::Infallible>> = bytes
        .chunks(chunk_size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    collect_stream(futures_util::stream::iter(chunks))
        .await
        .unwrap()
}

#[tokio::test]
async fn reassembles_tool_input_across_frames() {
    let bytes = wire(&[
        json!({"toolUseId": "t1", "name": "lookup"}),
        json!({"toolUseId": "t1", "input": "{\"q\""}),
        json!({"toolUseId": "t1", "input": ":\"hi\"}"}),
        json!({"toolUseId": "t1", "stop": true}),
    ]);
    let output = collect(bytes, 11).await;

    assert_eq!(output.text, "");
    assert_eq!(output.tool_uses.len(), 1);
    assert_eq!(output.tool_uses[0].id, "t1");
    assert_eq!(output.tool_uses[0].name, "lookup");
    assert_eq!(output.tool_uses[0].input, json!({"q": "hi"}));
    assert_eq!(output.stop_reason(), StopReason::ToolUse);
}

#[tokio::test]
async fn mixes_text_and_multiple_tools() {
    let bytes = wire(&[
        json!({"content": "working on it"}),
        json!({"toolUseId": "a", "name": "first", "input": "{\"n\":1}"}),
        json!({"toolUseId": "a", "stop": true}),
        json!({"toolUseId": "b", "name": "second"}),
        json!({"toolUseId": "b", "input": {"whole": true}}),
        json!({"toolUseId": "b", "stop": true}),
        json!({"content": " done"}),
    ]);
    let output = collect(bytes, 31).await;

    assert_eq!(output.text, "working on it done");
    assert_eq!(output.tool_uses.len(), 2);
    assert_eq!(output.tool_uses[0].name, "first");
    assert_eq!(output.tool_uses[0].input, json!({"n": 1}));
    assert_eq!(output.tool_uses[1].name, "second");
    assert_eq!(output.tool_uses[1].input, json!({"whole": true}));
    assert_eq!(output.stop_reason(), StopReason::ToolUse);
}

#[tokio::test]
async fn text_only_stream_ends_turn() {
    let bytes = wire(&[json!({"content": "plain"}), json!({"content": " answer"})]);
    let output = collect(bytes, 1024).await;
    assert_eq!(output.text, "plain answer");
    assert!(output.tool_uses.is_empty());
    assert_eq!(output.stop_reason(), StopReason::EndTurn);
    assert!(output.estimate_output_tokens() >= 1);
}

#[tokio::test]
async fn length_exception_forces_max_tokens() {
    let bytes = wire(&[
        json!({"content": "partial"}),
        json!({"__type": "ContentLengthExceededException"}),
    ]);
    let output = collect(bytes, 1024).await;
    assert_eq!(output.stop_reason(), StopReason::MaxTokens);
}
