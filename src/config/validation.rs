use super::{AppConfig, AuthMethod, ConfigError};

/// Validate semantic constraints that serde defaults cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] describing the first violated rule.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client_authentication.allowed_keys.is_empty() {
        return Err(ConfigError::Validation(
            "client_authentication.allowed_keys must contain at least one key".to_string(),
        ));
    }
    if config
        .client_authentication
        .allowed_keys
        .iter()
        .any(|key| key.trim().is_empty())
    {
        return Err(ConfigError::Validation(
            "client_authentication.allowed_keys must not contain empty keys".to_string(),
        ));
    }

    for (field, value) in [
        ("upstream.base_url", &config.upstream.base_url),
        ("upstream.social_refresh_url", &config.upstream.social_refresh_url),
        ("upstream.idc_refresh_url", &config.upstream.idc_refresh_url),
        ("upstream.usage_limits_url", &config.upstream.usage_limits_url),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{field} must not be empty")));
        }
        if !value.starts_with("http://") && !value.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "{field} must be an http(s) URL, got '{value}'"
            )));
        }
    }

    let enabled = config.credentials.iter().filter(|c| !c.disabled).count();
    if enabled == 0 {
        return Err(ConfigError::Validation(
            "credentials must contain at least one enabled entry".to_string(),
        ));
    }

    for (i, cred) in config.credentials.iter().enumerate() {
        if cred.refresh_token.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "credentials[{i}].refreshToken must not be empty"
            )));
        }
        if cred.auth == AuthMethod::IdC
            && (cred.client_id.as_deref().unwrap_or("").is_empty()
                || cred.client_secret.as_deref().unwrap_or("").is_empty())
        {
            return Err(ConfigError::Validation(format!(
                "credentials[{i}] uses IdC auth and requires clientId and clientSecret"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ClientAuthConfig, CredentialConfig, FeaturesConfig, ServerConfig, UpstreamConfig,
    };

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                base_url: "https://up.example.com/call".to_string(),
                social_refresh_url: "https://auth.example.com/refresh".to_string(),
                idc_refresh_url: "https://oidc.example.com/token".to_string(),
                usage_limits_url: "https://up.example.com/usage".to_string(),
                profile_arn: None,
            },
            credentials: vec![CredentialConfig {
                auth: AuthMethod::Social,
                refresh_token: "rt".to_string(),
                client_id: None,
                client_secret: None,
                disabled: false,
                description: None,
            }],
            client_authentication: ClientAuthConfig {
                allowed_keys: vec!["key".to_string()],
            },
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn rejects_empty_key_set() {
        let mut config = base_config();
        config.client_authentication.allowed_keys.clear();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_all_disabled_credentials() {
        let mut config = base_config();
        config.credentials[0].disabled = true;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_idc_without_client_secret() {
        let mut config = base_config();
        config.credentials[0].auth = AuthMethod::IdC;
        config.credentials[0].client_id = Some("cid".to_string());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let mut config = base_config();
        config.upstream.base_url = "ftp://nope".to_string();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation(_))
        ));
    }
}
