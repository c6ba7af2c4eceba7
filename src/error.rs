use crate::protocol::error_shapes::{anthropic_error_payload, openai_error_payload};
use crate::protocol::IngressApi;

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    Overloaded,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            GatewayError::Auth(_) => ErrorCategory::Authentication,
            GatewayError::Credential(_) => ErrorCategory::Overloaded,
            GatewayError::Config(_)
            | GatewayError::Transport(_)
            | GatewayError::Internal(_) => ErrorCategory::ServerError,
            GatewayError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::Overloaded => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Format an error for a given ingress API, returning (`status_code`, JSON body).
///
/// Errors from the upstream keep their original status so clients can
/// distinguish upstream 4xx from gateway faults.
#[must_use]
pub fn format_error(
    err: &GatewayError,
    ingress: IngressApi,
) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let status = match err {
        GatewayError::Upstream { status, .. } => {
            http::StatusCode::from_u16(*status).unwrap_or(http::StatusCode::BAD_GATEWAY)
        }
        _ => http_status_for_category(cat),
    };
    let message = err.to_string();

    let body = match ingress {
        IngressApi::OpenAiChat => openai_error_payload(cat, &message),
        IngressApi::Anthropic => anthropic_error_payload(cat, &message),
    };

    (status, body)
}

/// Convert a `GatewayError` into an axum response for a specific ingress.
#[must_use]
pub fn into_axum_response(err: &GatewayError, ingress: IngressApi) -> axum::response::Response {
    use axum::response::IntoResponse;
    let (status, body) = format_error(err, ingress);
    (status, axum::Json(body)).into_response()
}

/// Default `IntoResponse` implementation uses `Anthropic` as the fallback
/// ingress. Real handlers should call [`into_axum_response`] with the correct
/// ingress instead.
impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        into_axum_response(&self, IngressApi::Anthropic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_maps_to_category() {
        assert_eq!(
            category_from_upstream_status(429),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            category_from_upstream_status(503),
            ErrorCategory::ServerError
        );
        assert_eq!(category_from_upstream_status(302), ErrorCategory::Unknown);
    }

    #[test]
    fn upstream_error_keeps_original_status() {
        let err = GatewayError::Upstream {
            status: 403,
            message: "denied".to_string(),
        };
        let (status, _) = format_error(&err, IngressApi::Anthropic);
        assert_eq!(status, http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn credential_errors_surface_as_service_unavailable() {
        let err = GatewayError::Credential("all credentials failed".to_string());
        let (status, body) = format_error(&err, IngressApi::OpenAiChat);
        assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("all credentials failed"));
    }
}
