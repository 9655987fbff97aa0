use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RefreshConfig;
use crate::error::{GatewayError, Result};
use crate::http_client::client_for_url_with_timeout;
use crate::pool::{Credential, OAuthCredentials};

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedTokens {
    pub tokens: OAuthCredentials,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<RefreshedTokens>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// AWS OIDC 风格的 refresh_token 换取
pub struct OidcTokenRefresher {
    config: RefreshConfig,
}

impl OidcTokenRefresher {
    pub fn new(config: RefreshConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }
}

#[async_trait]
impl TokenRefresher for OidcTokenRefresher {
    async fn refresh(&self, credential: &Credential) -> Result<RefreshedTokens> {
        let current = credential
            .secret
            .oauth()
            .ok_or_else(|| GatewayError::Refresh("credential is not an OAuth credential".into()))?;
        if current.refresh_token.trim().is_empty() {
            return Err(GatewayError::Refresh("refresh token is empty".into()));
        }
        let (client_id, client_secret) = current
            .client_pair()
            .ok_or_else(|| GatewayError::Refresh("missing clientId or clientSecret".into()))?;

        let url = self.config.token_url(current.region.as_deref());
        let client = client_for_url_with_timeout(&url, self.timeout())?;
        let resp = client
            .post(&url)
            .json(&TokenRequest {
                client_id,
                client_secret,
                refresh_token: &current.refresh_token,
                grant_type: "refresh_token",
            })
            .send()
            .await
            .map_err(|e| GatewayError::Refresh(format!("failed to send request: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Refresh(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(GatewayError::Refresh(format!(
                "refresh failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Refresh(format!("failed to parse response: {}", e)))?;
        if parsed.access_token.is_empty() {
            return Err(GatewayError::Refresh("response carried no access token".into()));
        }

        let mut tokens = current.clone();
        tokens.access_token = parsed.access_token;
        // 没返回新的 refresh token 就沿用旧的
        if let Some(rt) = parsed.refresh_token.filter(|t| !t.is_empty()) {
            tokens.refresh_token = rt;
        }
        let expires_at = if parsed.expires_in > 0 {
            Some(Utc::now() + chrono::Duration::seconds(parsed.expires_in))
        } else {
            credential.expires_at
        };
        Ok(RefreshedTokens { tokens, expires_at })
    }
}
