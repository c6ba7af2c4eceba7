//! POST /v1/chat/completions.

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

use super::{call_upstream, sse_ok_response};
use crate::error::{into_axum_response, GatewayError};
use crate::eventstream::decoder::FrameDecoder;
use crate::eventstream::event::EventInterpreter;
use crate::observability::log_request_complete;
use crate::observability::token_estimator::estimate_request_tokens;
use crate::protocol::openai::ChatCompletionRequest;
use crate::protocol::{convert, IngressApi};
use crate::state::AppState;
use crate::stream::collector::collect_stream;
use crate::stream::openai_sse::{upstream_error_frame, OpenAiStreamProjector};
use crate::stream::{frames_to_bytes, SseFrame};
use crate::util::unix_now_secs;

const INGRESS: IngressApi = IngressApi::OpenAiChat;

/// POST /v1/chat/completions
pub async fn chat_completions_handler(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    if let Err(err) = state.authenticate(INGRESS, &headers) {
        return into_axum_response(&err, INGRESS);
    }

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
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
        "POST /v1/chat/completions"
    );

    let converted = convert::openai_to_anthropic(&request);
    let input_tokens = estimate_request_tokens(&converted);

    let response = match call_upstream(&state, &converted).await {
        Ok(response) => response,
        Err(err) => return into_axum_response(&err, INGRESS),
    };

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "upstream error: {message}");
        if request.wants_stream() {
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
        let projector = OpenAiStreamProjector::new(
            &request.model,
            state.next_completion_id(),
            unix_now_secs(),
        );
        let stream =
            openai_sse_stream(response, projector, request.model.clone(), input_tokens, started);
        return sse_ok_response(Body::from_stream(stream));
    }

    match collect_stream(response.bytes_stream()).await {
        Ok(output) => {
            let body = convert::chat_completion(
                &output,
                &request.model,
                &state.next_completion_id(),
                unix_now_secs(),
                input_tokens,
            );
            log_request_complete(
                &request.model,
                body.usage.prompt_tokens,
                body.usage.completion_tokens,
                started,
            );
            Json(body).into_response()
        }
        Err(err) => into_axum_response(&err, INGRESS),
    }
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

struct ProjectionDriver {
    bytes: UpstreamBytes,
    decoder: FrameDecoder,
    interpreter: EventInterpreter,
    projector: OpenAiStreamProjector,
    model: String,
    input_tokens: u64,
    started: Instant,
    phase: Phase,
}

impl ProjectionDriver {
    fn finish_frames(&mut self) -> Vec<SseFrame> {
        self.phase = Phase::Done;
        let frames: Vec<SseFrame> = self.projector.finish().into_iter().collect();
        self.log_complete();
        frames
    }

    fn log_complete(&self) {
        log_request_complete(
            &self.model,
            self.input_tokens,
            self.projector.output_tokens(),
            self.started,
        );
    }
}

/// Drive the upstream body through the OpenAI projection. On early
/// termination (length exception) the remaining upstream bytes are never
/// read; dropping the body stream cancels the transfer.
fn openai_sse_stream(
    response: reqwest::Response,
    projector: OpenAiStreamProjector,
    model: String,
    input_tokens: u64,
    started: Instant,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let driver = ProjectionDriver {
        bytes: Box::pin(response.bytes_stream()),
        decoder: FrameDecoder::new(),
        interpreter: EventInterpreter::new(),
        projector,
        model,
        input_tokens,
        started,
        phase: Phase::Begin,
    };

    futures_util::stream::unfold(driver, |mut driver| async move {
        loop {
            match driver.phase {
                Phase::Begin => {
                    driver.phase = Phase::Streaming;
                    let frames: Vec<SseFrame> = driver.projector.begin().into_iter().collect();
                    return Some((Ok(frames_to_bytes(&frames)), driver));
                }
                Phase::Streaming => match driver.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let mut messages = Vec::new();
                        let mut frames: Vec<SseFrame> = Vec::new();
                        let decode = driver.decoder.feed(&chunk, &mut messages);
                        'messages: for message in &messages {
                            for event in driver.interpreter.interpret(message) {
                                frames.extend(driver.projector.on_event(&event));
                                if driver.projector.should_terminate() {
                                    break 'messages;
                                }
                            }
                        }
                        if driver.projector.should_terminate() {
                            driver.phase = Phase::Done;
                            driver.log_complete();
                            return Some((Ok(frames_to_bytes(&frames)), driver));
                        }
                        if let Err(err) = decode {
                            tracing::warn!("terminating stream: {err}");
                            frames.extend(driver.finish_frames());
                            return Some((Ok(frames_to_bytes(&frames)), driver));
                        }
                        if frames.is_empty() {
                            continue;
                        }
                        return Some((Ok(frames_to_bytes(&frames)), driver));
                    }
                    Some(Err(err)) => {
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
