pub mod anthropic;
pub mod health;
pub mod models;
pub mod openai;

use axum::body::Body;
use axum::response::Response;

use crate::error::GatewayError;
use crate::protocol::anthropic::AnthropicRequest;
use crate::protocol::convert;
use crate::state::AppState;

/// Select a credential, convert the request, and launch the upstream call.
///
/// Non-2xx upstream statuses are returned as `Ok` responses; the callers
/// shape them per ingress.
///
/// # Errors
///
/// Returns [`GatewayError::Credential`] when no credential can be obtained
/// and [`GatewayError::Transport`] when the request cannot be sent.
pub(crate) async fn call_upstream(
    state: &AppState,
    request: &AnthropicRequest,
) -> Result<reqwest::Response, GatewayError> {
    let selected = state.pool.select().await?;
    tracing::debug!(
        credential = selected.index,
        quota = selected.available_before,
        "selected pool credential"
    );

    let conversation_id = uuid::Uuid::new_v4().to_string();
    let profile_arn = selected
        .profile_arn
        .clone()
        .or_else(|| state.config.upstream.profile_arn.clone());
    let payload =
        convert::anthropic_to_upstream(request, &conversation_id, profile_arn.as_deref());
    state.upstream.send(&payload, &selected.access_token).await
}

pub(crate) fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}
