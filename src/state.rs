use std::sync::atomic::AtomicU64;

use crate::auth::{authenticate, AllowedClientKeys};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::pool::CredentialPool;
use crate::protocol::IngressApi;
use crate::transport::UpstreamClient;
use crate::util::next_generated_id;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub pool: CredentialPool,
    pub upstream: UpstreamClient,
    allowed_client_keys: AllowedClientKeys,
    message_ids: AtomicU64,
    completion_ids: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: AppConfig,
        pool: CredentialPool,
        upstream: UpstreamClient,
        allowed_client_keys: AllowedClientKeys,
    ) -> Self {
        Self {
            config,
            pool,
            upstream,
            allowed_client_keys,
            message_ids: AtomicU64::new(1),
            completion_ids: AtomicU64::new(1),
        }
    }

    /// Authenticate an ingress request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Auth` when the API key is missing or invalid.
    pub fn authenticate(
        &self,
        ingress: IngressApi,
        headers: &http::HeaderMap,
    ) -> Result<(), GatewayError> {
        authenticate(ingress, headers, &self.allowed_client_keys)
    }

    #[must_use]
    pub fn next_message_id(&self) -> String {
        next_generated_id("msg_", &self.message_ids)
    }

    #[must_use]
    pub fn next_completion_id(&self) -> String {
        next_generated_id("chatcmpl-", &self.completion_ids)
    }
}
