use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::protocol::IngressApi;
use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashSet;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Compact key index used in hot-path authentication.
pub enum AllowedClientKeys {
    Empty,
    Single { raw: Box<str>, bearer: Box<str> },
    Multiple(FxHashSet<String>),
}

/// Extract the API key from request headers.
///
/// Both ingress flavours accept either convention; the flavour only decides
/// which header is checked first:
///
/// - Anthropic: `x-api-key: <key>` first, then `Authorization: Bearer <key>`
/// - `OpenAiChat`: `Authorization: Bearer <key>` first, then `x-api-key`
///
/// # Errors
///
/// Returns `GatewayError::Auth` when no API key header is present.
pub fn extract_api_key(
    ingress: IngressApi,
    headers: &http::HeaderMap,
) -> Result<&str, GatewayError> {
    let from_api_key_header = || headers.get(X_API_KEY).and_then(|v| v.to_str().ok());
    let from_bearer = || {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
    };

    let key = match ingress {
        IngressApi::Anthropic => from_api_key_header().or_else(from_bearer),
        IngressApi::OpenAiChat => from_bearer().or_else(from_api_key_header),
    };

    key.ok_or_else(|| GatewayError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request by checking the extracted key against
/// pre-indexed `allowed_keys`.
///
/// # Errors
///
/// Returns `GatewayError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    ingress: IngressApi,
    headers: &http::HeaderMap,
    allowed_keys: &AllowedClientKeys,
) -> Result<(), GatewayError> {
    match allowed_keys {
        AllowedClientKeys::Single { raw, bearer } => {
            authenticate_single_key(headers, raw.as_ref(), bearer.as_ref())
        }
        AllowedClientKeys::Multiple(allowed_set) => {
            let client_key = extract_api_key(ingress, headers)?;
            if allowed_set.contains(client_key) {
                Ok(())
            } else {
                Err(GatewayError::Auth("Invalid API key".to_string()))
            }
        }
        AllowedClientKeys::Empty => Err(GatewayError::Auth("Invalid API key".to_string())),
    }
}

fn authenticate_single_key(
    headers: &http::HeaderMap,
    raw_key: &str,
    bearer_key: &str,
) -> Result<(), GatewayError> {
    if let Some(value) = headers.get(X_API_KEY) {
        return if value.as_bytes() == raw_key.as_bytes() {
            Ok(())
        } else {
            Err(GatewayError::Auth("Invalid API key".to_string()))
        };
    }
    match headers.get(AUTHORIZATION) {
        Some(value) if value.as_bytes() == bearer_key.as_bytes() => Ok(()),
        Some(_) => Err(GatewayError::Auth("Invalid API key".to_string())),
        None => Err(GatewayError::Auth("Missing API key".to_string())),
    }
}

/// Build a hash-set index for allowed client keys.
#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let mut allowed_set: FxHashSet<String> = config
        .client_authentication
        .allowed_keys
        .iter()
        .cloned()
        .collect();

    match allowed_set.len() {
        0 => AllowedClientKeys::Empty,
        1 => match allowed_set.drain().next() {
            Some(single_key) => AllowedClientKeys::Single {
                bearer: format!("Bearer {single_key}").into_boxed_str(),
                raw: single_key.into_boxed_str(),
            },
            None => AllowedClientKeys::Empty,
        },
        _ => AllowedClientKeys::Multiple(allowed_set),
    }
}
