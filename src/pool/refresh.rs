//! Token refresh against the Social / IdC endpoints plus the usage-limits
//! quota probe.
//!
//! The [`TokenRefresher`] trait is the pool's seam to the network: the
//! production implementation below speaks HTTP, tests substitute their own.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;

use crate::config::{AuthMethod, CredentialConfig, UpstreamConfig};

/// Error from a refresh attempt. Clone-able so it can travel through a shared
/// single-flight future.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Http(String),
    #[error("refresh endpoint returned status {0}")]
    Status(u16),
    #[error("malformed refresh response: {0}")]
    Malformed(String),
}

/// Outcome of one successful refresh, quota probe included.
#[derive(Debug, Clone)]
pub struct RefreshedCredential {
    pub access_token: String,
    pub expires_in: Duration,
    pub refresh_token: Option<String>,
    pub profile_arn: Option<String>,
    pub available_quota: f64,
    pub usage: Option<UsageLimitsResponse>,
}

/// Seam between the credential pool and the refresh endpoints.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(
        &self,
        config: &CredentialConfig,
    ) -> BoxFuture<'static, Result<RefreshedCredential, RefreshError>>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    profile_arn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitsResponse {
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    pub resource_type: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default)]
    pub free_trial_info: Option<FreeTrialInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub free_trial_status: Option<String>,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

/// Remaining credit: CREDIT rows' base quota plus any ACTIVE free trial,
/// clamped to zero.
#[must_use]
pub fn available_quota(usage: &UsageLimitsResponse) -> f64 {
    let mut remaining = 0.0;
    for breakdown in &usage.usage_breakdown_list {
        if breakdown.resource_type != "CREDIT" {
            continue;
        }
        remaining +=
            breakdown.usage_limit_with_precision - breakdown.current_usage_with_precision;
        if let Some(trial) = &breakdown.free_trial_info {
            if trial.free_trial_status.as_deref() == Some("ACTIVE") {
                remaining +=
                    trial.usage_limit_with_precision - trial.current_usage_with_precision;
            }
        }
    }
    remaining.max(0.0)
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpTokenRefresher {
    client: reqwest::Client,
    social_refresh_url: String,
    idc_refresh_url: String,
    usage_limits_url: String,
}

impl HttpTokenRefresher {
    #[must_use]
    pub fn new(client: reqwest::Client, upstream: &UpstreamConfig) -> Self {
        Self {
            client,
            social_refresh_url: upstream.social_refresh_url.clone(),
            idc_refresh_url: upstream.idc_refresh_url.clone(),
            usage_limits_url: upstream.usage_limits_url.clone(),
        }
    }

    async fn post_refresh(
        client: &reqwest::Client,
        url: &str,
        body: serde_json::Value,
    ) -> Result<RefreshResponse, RefreshError> {
        let response = client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| RefreshError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Status(status.as_u16()));
        }
        response
            .json::<RefreshResponse>()
            .await
            .map_err(|err| RefreshError::Malformed(err.to_string()))
    }

    /// Probe remaining quota with the fresh access token. Failure is
    /// log-only: the refresh still succeeds with zero known quota.
    async fn probe_quota(
        client: &reqwest::Client,
        url: &str,
        access_token: &str,
    ) -> Option<UsageLimitsResponse> {
        let result = client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<UsageLimitsResponse>().await {
                    Ok(usage) => Some(usage),
                    Err(err) => {
                        tracing::warn!("usage-limits response malformed: {err}");
                        None
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(status = response.status().as_u16(), "usage-limits probe failed");
                None
            }
            Err(err) => {
                tracing::warn!("usage-limits probe failed: {err}");
                None
            }
        }
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh(
        &self,
        config: &CredentialConfig,
    ) -> BoxFuture<'static, Result<RefreshedCredential, RefreshError>> {
        let client = self.client.clone();
        let usage_limits_url = self.usage_limits_url.clone();
        let (url, body) = match config.auth {
            AuthMethod::Social => (
                self.social_refresh_url.clone(),
                serde_json::json!({ "refreshToken": config.refresh_token }),
            ),
            AuthMethod::IdC => (
                self.idc_refresh_url.clone(),
                serde_json::json!({
                    "clientId": config.client_id,
                    "clientSecret": config.client_secret,
                    "grantType": "refresh_token",
                    "refreshToken": config.refresh_token,
                }),
            ),
        };

        async move {
            let refreshed = Self::post_refresh(&client, &url, body).await?;
            let usage =
                Self::probe_quota(&client, &usage_limits_url, &refreshed.access_token).await;
            let quota = usage.as_ref().map_or(0.0, available_quota);
            Ok(RefreshedCredential {
                access_token: refreshed.access_token,
                expires_in: Duration::from_secs(refreshed.expires_in),
                refresh_token: refreshed.refresh_token,
                profile_arn: refreshed.profile_arn,
                available_quota: quota,
                usage,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(json: serde_json::Value) -> UsageLimitsResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn quota_sums_credit_rows_only() {
        let usage = usage(serde_json::json!({
            "usageBreakdownList": [
                {
                    "resourceType": "CREDIT",
                    "usageLimitWithPrecision": 50.0,
                    "currentUsageWithPrecision": 12.5
                },
                {
                    "resourceType": "AGENTIC_REQUEST",
                    "usageLimitWithPrecision": 1000.0,
                    "currentUsageWithPrecision": 0.0
                }
            ]
        }));
        assert!((available_quota(&usage) - 37.5).abs() < f64::EPSILON);
    }

    #[test]
    fn quota_includes_active_free_trial() {
        let usage = usage(serde_json::json!({
            "usageBreakdownList": [{
                "resourceType": "CREDIT",
                "usageLimitWithPrecision": 10.0,
                "currentUsageWithPrecision": 10.0,
                "freeTrialInfo": {
                    "freeTrialStatus": "ACTIVE",
                    "usageLimitWithPrecision": 5.0,
                    "currentUsageWithPrecision": 1.0
                }
            }]
        }));
        assert!((available_quota(&usage) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quota_ignores_expired_free_trial() {
        let usage = usage(serde_json::json!({
            "usageBreakdownList": [{
                "resourceType": "CREDIT",
                "usageLimitWithPrecision": 10.0,
                "currentUsageWithPrecision": 4.0,
                "freeTrialInfo": {
                    "freeTrialStatus": "EXPIRED",
                    "usageLimitWithPrecision": 5.0,
                    "currentUsageWithPrecision": 0.0
                }
            }]
        }));
        assert!((available_quota(&usage) - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quota_clamps_to_zero() {
        let usage = usage(serde_json::json!({
            "usageBreakdownList": [{
                "resourceType": "CREDIT",
                "usageLimitWithPrecision": 10.0,
                "currentUsageWithPrecision": 25.0
            }]
        }));
        assert_eq!(available_quota(&usage), 0.0);
    }

    #[test]
    fn refresh_response_parses_optional_fields() {
        let response: RefreshResponse = serde_json::from_str(
            r#"{"accessToken": "at", "expiresIn": 3600, "profileArn": "arn:aws:x"}"#,
        )
        .unwrap();
        assert_eq!(response.access_token, "at");
        assert_eq!(response.expires_in, 3600);
        assert!(response.refresh_token.is_none());
        assert_eq!(response.profile_arn.as_deref(), Some("arn:aws:x"));
    }
}
