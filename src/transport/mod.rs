//! Upstream HTTP client: one pooled reqwest client for the EventStream call
//! endpoint, plus the client builder shared with the token refresher.

use std::time::Duration;

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::GatewayError;

const USER_AGENT: &str =
    "aws-sdk-js/1.0.27 ua/2.1 os/linux lang/js md/nodejs api/codewhispererstreaming#1.0.27";
const AMZ_USER_AGENT: &str = "aws-sdk-js/1.0.27";

/// Build the process-wide HTTP client with pooling and timeouts from config.
///
/// # Errors
///
/// Returns [`GatewayError::Transport`] when the TLS backend fails to
/// initialise.
pub fn build_http_client(config: &ServerConfig) -> Result<reqwest::Client, GatewayError> {
    let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
    };

    reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(config.timeout))
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Client for the EventStream call endpoint.
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(client: reqwest::Client, upstream: &UpstreamConfig) -> Self {
        Self {
            client,
            base_url: upstream.base_url.clone(),
        }
    }

    /// POST the converted request body with a bearer token and the fixed
    /// SDK-style headers; return the streaming response.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    /// Non-2xx statuses are NOT an error here; callers decide how to shape
    /// them per ingress.
    pub async fn send(
        &self,
        body: &serde_json::Value,
        access_token: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        self.client
            .post(&self.base_url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header("x-amz-user-agent", AMZ_USER_AGENT)
            .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=3")
            .json(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("upstream request failed: {err}")))
    }
}
