//! POST /v1/messages and /v1/messages/count_tokens.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use super::{call_upstream, sse_ok_response};
use crate::error::{into_axum_response, GatewayError};
use crate::eventstream::decoder::FrameDecoder;
use crate::eventstream::event::EventInterpreter;
use crate::observability::log_request_complete;
use crate::observability::token_estimator::estimate_request_tokens;
use crate::protocol::anthropic::{AnthropicMessage, AnthropicRequest, AnthropicTool};
use crate::protocol::{convert, IngressApi};
use crate::state::AppState;
use crate::stream::anthropic_sse::{
    transport_error_frame, upstream_error_frame, AnthropicStreamEmitter,
};
use crate::stream::collector::collect_stream;
use crate::stream::{frames_to_bytes, SseFrame};

const INGRESS: IngressApi = IngressApi::Anthropic;

/// POST /v1/messages
pub async fn messages_handler(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    if let Err(err) = state.authenticate(INGRESS, &headers) {
        return into_axum_response(&err, INGRESS);
    }

    let request: AnthropicRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return into_axum_response(
                &GatewayError::InvalidRequest(format!("invalid JSON body: {err}")),
                INGRESS,
            )
        }
    };
    if request.messages.is_empty() {
        return into_axum_response(
            &GatewayError::InvalidRequest("messages must not be empty".to_string()),
            INGRESS,
        );
    }

    tracing::info!(
        model = %request.model,
        stream = request.wants_stream(),
        message_count = request.messages.len(),
        "POST /v1/messages"
    );

    let input_tokens = estimate_request_tokens(&request);

    let response = match call_upstream(&state, &request).await {
        Ok(response) => response,
        Err(err) => return into_axum_response(&err, INGRESS),
    };

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "upstream error: {message}");
        if request.wants_stream() {
            // A failed upstream call never opens a message: one error record.
            let frame = upstream_error_frame(status.as_u16(), &message);
            return sse_ok_response(Body::from(frame.to_sse_string()));
        }
        return into_axum_response(
            &GatewayError::Upstream {
                status: status.as_u16(),
                message,
            },
            INGRESS,
        );
    }

    if request.wants_stream() {
        let emitter =
            AnthropicStreamEmitter::new(&request.model, state.next_message_id(), input_tokens);
        let stream = anthropic_sse_stream(response, emitter, request.model.clone(), started);
        return sse_ok_response(Body::from_stream(stream));
    }

    match collect_stream(response.bytes_stream()).await {
        Ok(output) => {
            let body = convert::anthropic_response(
                &output,
                &request.model,
                &state.next_message_id(),
                input_tokens,
            );
            log_request_complete(
                &request.model,
                body.usage.input_tokens,
                body.usage.output_tokens,
                started,
            );
            Json(body).into_response()
        }
        Err(err) => into_axum_response(&err, INGRESS),
    }
}

// ---------------------------------------------------------------------------
// count_tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CountTokensRequest {
    model: String,
    #[serde(default)]
    system: Option<serde_json::Value>,
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    tools: Option<Vec<AnthropicTool>>,
}

/// POST /v1/messages/count_tokens — estimate from the body alone.
pub fn count_tokens_handler(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(err) = state.authenticate(INGRESS, &headers) {
        return into_axum_response(&err, INGRESS);
    }
    let request: CountTokensRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return into_axum_response(
                &GatewayError::InvalidRequest(format!("invalid JSON body: {err}")),
                INGRESS,
            )
        }
    };

    let shaped = AnthropicRequest {
        model: request.model,
        max_tokens: 1,
        system: request.system,
        messages: request.messages,
        tools: request.tools,
        tool_choice: None,
        stream: None,
        temperature: None,
        top_p: None,
        top_k: None,
        stop_sequences: None,
        extra: serde_json::Map::new(),
    };
    let input_tokens = estimate_request_tokens(&shaped).max(1);
    Json(serde_json::json!({ "input_tokens": input_tokens })).into_response()
}

// ---------------------------------------------------------------------------
// SSE stream driver
// ---------------------------------------------------------------------------

type UpstreamBytes = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

enum Phase {
    Begin,
    Streaming,
    Done,
}

struct SseDriver {
    bytes: UpstreamBytes,
    decoder: FrameDecoder,
    interpreter: EventInterpreter,
    emitter: AnthropicStreamEmitter,
    model: String,
    started: Instant,
    phase: Phase,
}

impl SseDriver {
    fn finish_frames(&mut self) -> Vec<SseFrame> {
        self.phase = Phase::Done;
        let frames: Vec<SseFrame> = self.emitter.finish().into_iter().collect();
        let (input_tokens, output_tokens) = self.emitter.usage();
        log_request_complete(&self.model, input_tokens, output_tokens, self.started);
        frames
    }
}

/// Drive the upstream body through decoder, interpreter, and emitter,
/// yielding SSE byte chunks. Dropping the stream (client disconnect) drops
/// the upstream reader and all per-stream state with it.
fn anthropic_sse_stream(
    response: reqwest::Response,
    emitter: AnthropicStreamEmitter,
    model: String,
    started: Instant,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let driver = SseDriver {
        bytes: Box::pin(response.bytes_stream()),
        decoder: FrameDecoder::new(),
        interpreter: EventInterpreter::new(),
        emitter,
        model,
        started,
        phase: Phase::Begin,
    };

    futures_util::stream::unfold(driver, |mut driver| async move {
        loop {
            match driver.phase {
                Phase::Begin => {
                    driver.phase = Phase::Streaming;
                    let frames: Vec<SseFrame> = driver.emitter.begin().into_iter().collect();
                    return Some((Ok(frames_to_bytes(&frames)), driver));
                }
                Phase::Streaming => match driver.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let mut messages = Vec::new();
                        let mut frames: Vec<SseFrame> = Vec::new();
                        let decode = driver.decoder.feed(&chunk, &mut messages);
                        for message in &messages {
                            for event in driver.interpreter.interpret(message) {
                                frames.extend(driver.emitter.on_event(&event));
                            }
                        }
                        if let Err(err) = decode {
                            tracing::warn!("terminating stream: {err}");
                            frames.push(transport_error_frame(&err.to_string()));
                            frames.extend(driver.finish_frames());
                            return Some((Ok(frames_to_bytes(&frames)), driver));
                        }
                        if frames.is_empty() {
                            continue;
                        }
                        return Some((Ok(frames_to_bytes(&frames)), driver));
                    }
                    Some(Err(err)) => {
                        // Treat a broken upstream body like end-of-stream:
                        // close open blocks and finish the message.
                        tracing::warn!("upstream body error: {err}");
                        let frames = driver.finish_frames();
                        return Some((Ok(frames_to_bytes(&frames)), driver));
                    }
                    None => {
                        let frames = driver.finish_frames();
                        return Some((Ok(frames_to_bytes(&frames)), driver));
                    }
                },
                Phase::Done => return None,
            }
        }
    })
}
