use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::error::into_axum_response;
use crate::protocol::IngressApi;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct Model {
    id: &'static str,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
    display_name: &'static str,
}

const MODELS: &[Model] = &[
    Model {
        id: "claude-sonnet-4-5-20250929",
        object: "model",
        created: 1_727_568_000,
        owned_by: "anthropic",
        display_name: "Claude Sonnet 4.5",
    },
    Model {
        id: "claude-haiku-4-5-20251001",
        object: "model",
        created: 1_727_740_800,
        owned_by: "anthropic",
        display_name: "Claude Haiku 4.5",
    },
    Model {
        id: "claude-opus-4-5-20251101",
        object: "model",
        created: 1_730_419_200,
        owned_by: "anthropic",
        display_name: "Claude Opus 4.5",
    },
    Model {
        id: "claude-sonnet-4-20250514",
        object: "model",
        created: 1_715_644_800,
        owned_by: "anthropic",
        display_name: "Claude Sonnet 4",
    },
];

/// GET /v1/models — the static model catalogue.
pub fn handler(state: &AppState, headers: &http::HeaderMap) -> axum::response::Response {
    if let Err(err) = state.authenticate(IngressApi::OpenAiChat, headers) {
        return into_axum_response(&err, IngressApi::OpenAiChat);
    }
    Json(serde_json::json!({
        "object": "list",
        "data": MODELS,
    }))
    .into_response()
}
