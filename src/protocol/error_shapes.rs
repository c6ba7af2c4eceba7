use crate::error::ErrorCategory;
use serde_json::{json, Value};

fn anthropic_error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::Overloaded => "overloaded_error",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "api_error",
    }
}

fn openai_error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::Overloaded | ErrorCategory::ServerError | ErrorCategory::Unknown => {
            "api_error"
        }
    }
}

/// Anthropic-shaped error body: `{"type":"error","error":{...}}`.
#[must_use]
pub fn anthropic_error_payload(cat: ErrorCategory, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": anthropic_error_type(cat),
            "message": message,
        }
    })
}

/// OpenAI-shaped error body: `{"error":{...}}`.
#[must_use]
pub fn openai_error_payload(cat: ErrorCategory, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": openai_error_type(cat),
            "code": null,
        }
    })
}
