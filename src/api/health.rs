use axum::response::IntoResponse;
use axum::Json;

/// GET / — liveness probe.
pub fn handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
