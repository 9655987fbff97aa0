use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ProviderKind;
use crate::routing::SelectionStrategy;
use crate::server::util::mask_key;

pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// 错误率达到该值即视为不健康
pub const UNHEALTHY_ERROR_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AuthType {
    pub fn as_db_value(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::OAuth => "oauth",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "api_key" => Some(Self::ApiKey),
            "oauth" => Some(Self::OAuth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_db_value(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_db_value(value: Option<&str>) -> Self {
        match value.unwrap_or_default() {
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyCredentials {
    pub key: String,
}

/// OAuth 令牌组；client_id/client_secret 供刷新使用
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl OAuthCredentials {
    pub fn client_pair(&self) -> Option<(&str, &str)> {
        let id = self.client_id.as_deref().filter(|s| !s.is_empty())?;
        let secret = self.client_secret.as_deref().filter(|s| !s.is_empty())?;
        Some((id, secret))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type")]
pub enum CredentialSecret {
    #[serde(rename = "api_key")]
    ApiKey(ApiKeyCredentials),
    #[serde(rename = "oauth")]
    OAuth(OAuthCredentials),
}

impl CredentialSecret {
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::ApiKey(_) => AuthType::ApiKey,
            Self::OAuth(_) => AuthType::OAuth,
        }
    }

    pub fn oauth(&self) -> Option<&OAuthCredentials> {
        match self {
            Self::OAuth(o) => Some(o),
            Self::ApiKey(_) => None,
        }
    }
}

/// 发往上游时使用的认证材料
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAuth<'a> {
    ApiKey(&'a str),
    Bearer(&'a str),
}

/// 导入账号附带的订阅/用量信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub id: i64,
    pub pool_id: i64,
    pub provider: ProviderKind,
    pub secret: CredentialSecret,
    pub account_name: Option<String>,
    pub account_email: Option<String>,
    pub profile: AccountProfile,
    pub expires_at: Option<DateTime<Utc>>,
    pub weight: u32,
    pub is_active: bool,
    pub health_status: HealthStatus,
    pub last_error: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub total_errors: i64,
    /// 每分钟请求上限，0 表示不限
    pub rate_limit: u32,
    pub current_usage: u32,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(pool_id: i64, provider: ProviderKind, secret: CredentialSecret) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            pool_id,
            provider,
            secret,
            account_name: None,
            account_email: None,
            profile: AccountProfile::default(),
            expires_at: None,
            weight: 1,
            is_active: true,
            health_status: HealthStatus::Unknown,
            last_error: None,
            last_used_at: None,
            total_requests: 0,
            total_errors: 0,
            rate_limit: 0,
            current_usage: 0,
            rate_limit_reset_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.secret.auth_type()
    }

    pub fn upstream_auth(&self) -> UpstreamAuth<'_> {
        match &self.secret {
            CredentialSecret::ApiKey(k) => UpstreamAuth::ApiKey(&k.key),
            CredentialSecret::OAuth(o) => UpstreamAuth::Bearer(&o.access_token),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// 窗口过期后计数隐式归零
    pub fn window_usage(&self, now: DateTime<Utc>) -> u32 {
        match self.rate_limit_reset_at {
            Some(reset) if now <= reset => self.current_usage,
            _ => 0,
        }
    }

    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limit > 0 && self.window_usage(now) >= self.rate_limit
    }

    /// 按固定顺序给出不可用原因
    pub fn ineligibility(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if !self.is_active {
            Some("inactive")
        } else if self.health_status == HealthStatus::Unhealthy {
            Some("unhealthy")
        } else if self.is_expired(now) {
            Some("expired")
        } else if self.is_rate_limited(now) {
            Some("rate_limited")
        } else {
            None
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.ineligibility(now).is_none()
    }

    pub fn error_rate(&self) -> f64 {
        error_rate(self.total_requests, self.total_errors)
    }

    /// OAuth 且有 refresh token，且在 now + horizon 之前过期
    pub fn needs_refresh(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        let Some(oauth) = self.secret.oauth() else {
            return false;
        };
        if oauth.refresh_token.trim().is_empty() {
            return false;
        }
        self.expires_at.is_some_and(|exp| exp <= now + horizon)
    }

    pub fn display_name(&self) -> String {
        self.account_email
            .clone()
            .or_else(|| self.account_name.clone())
            .unwrap_or_else(|| format!("credential#{}", self.id))
    }
}

pub fn error_rate(requests: i64, errors: i64) -> f64 {
    if requests <= 0 {
        return 0.0;
    }
    errors as f64 / requests as f64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pool {
    pub id: i64,
    pub name: String,
    pub provider: ProviderKind,
    pub description: Option<String>,
    pub strategy: SelectionStrategy,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub max_retries: u32,
    pub is_active: bool,
    pub total_requests: i64,
    pub total_errors: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn new(name: impl Into<String>, provider: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            provider,
            description: None,
            strategy: SelectionStrategy::default(),
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            is_active: true,
            total_requests: 0,
            total_errors: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn error_rate(&self) -> f64 {
        error_rate(self.total_requests, self.total_errors)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_active && self.error_rate() < UNHEALTHY_ERROR_RATE
    }
}

/// 对外展示用，密钥只保留首尾
#[derive(Debug, Clone, Serialize)]
pub struct CredentialResponse {
    pub id: i64,
    pub pool_id: i64,
    pub provider: ProviderKind,
    pub auth_type: AuthType,
    pub secret_hint: String,
    pub has_refresh_token: bool,
    pub account_name: Option<String>,
    pub account_email: Option<String>,
    pub profile: AccountProfile,
    pub expires_at: Option<DateTime<Utc>>,
    pub weight: u32,
    pub is_active: bool,
    pub health_status: HealthStatus,
    pub last_error: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub total_errors: i64,
    pub error_rate: f64,
    pub rate_limit: u32,
    pub current_usage: u32,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Credential> for CredentialResponse {
    fn from(c: &Credential) -> Self {
        let now = Utc::now();
        let (secret_hint, has_refresh_token) = match &c.secret {
            CredentialSecret::ApiKey(k) => (mask_key(&k.key), false),
            CredentialSecret::OAuth(o) => (mask_key(&o.access_token), !o.refresh_token.is_empty()),
        };
        Self {
            id: c.id,
            pool_id: c.pool_id,
            provider: c.provider,
            auth_type: c.auth_type(),
            secret_hint,
            has_refresh_token,
            account_name: c.account_name.clone(),
            account_email: c.account_email.clone(),
            profile: c.profile.clone(),
            expires_at: c.expires_at,
            weight: c.weight,
            is_active: c.is_active,
            health_status: c.health_status,
            last_error: c.last_error.clone(),
            last_used_at: c.last_used_at,
            total_requests: c.total_requests,
            total_errors: c.total_errors,
            error_rate: c.error_rate(),
            rate_limit: c.rate_limit,
            current_usage: c.window_usage(now),
            rate_limit_reset_at: c.rate_limit_reset_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn api_key_credential(id: i64, weight: u32) -> Credential {
        let mut c = Credential::new(
            1,
            ProviderKind::OpenAI,
            CredentialSecret::ApiKey(ApiKeyCredentials {
                key: format!("sk-test-{id:04}-abcdef"),
            }),
        );
        c.id = id;
        c.weight = weight;
        c.health_status = HealthStatus::Healthy;
        c
    }

    #[test]
    fn eligibility_checks_run_in_order() {
        let now = Utc::now();
        let mut c = api_key_credential(1, 1);
        assert!(c.is_eligible(now));

        c.is_active = false;
        c.health_status = HealthStatus::Unhealthy;
        assert_eq!(c.ineligibility(now), Some("inactive"));

        c.is_active = true;
        assert_eq!(c.ineligibility(now), Some("unhealthy"));

        c.health_status = HealthStatus::Unknown;
        c.expires_at = Some(now - Duration::seconds(1));
        assert_eq!(c.ineligibility(now), Some("expired"));

        c.expires_at = Some(now + Duration::hours(1));
        assert!(c.is_eligible(now));
    }

    #[test]
    fn rate_limit_window_resets_implicitly() {
        let now = Utc::now();
        let mut c = api_key_credential(1, 1);
        c.rate_limit = 2;
        c.current_usage = 2;
        c.rate_limit_reset_at = Some(now + Duration::seconds(30));
        assert!(c.is_rate_limited(now));
        assert_eq!(c.ineligibility(now), Some("rate_limited"));

        // 窗口已过
        c.rate_limit_reset_at = Some(now - Duration::seconds(1));
        assert!(!c.is_rate_limited(now));
        assert_eq!(c.window_usage(now), 0);

        c.rate_limit = 0;
        c.rate_limit_reset_at = Some(now + Duration::seconds(30));
        c.current_usage = 10_000;
        assert!(!c.is_rate_limited(now));
    }

    #[test]
    fn refresh_needed_only_inside_horizon_with_token() {
        let now = Utc::now();
        let mut c = Credential::new(
            1,
            ProviderKind::Anthropic,
            CredentialSecret::OAuth(OAuthCredentials {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                ..Default::default()
            }),
        );
        c.expires_at = Some(now + Duration::minutes(10));
        assert!(c.needs_refresh(now, Duration::minutes(30)));

        c.expires_at = Some(now + Duration::hours(2));
        assert!(!c.needs_refresh(now, Duration::minutes(30)));

        c.expires_at = Some(now + Duration::minutes(10));
        c.secret = CredentialSecret::OAuth(OAuthCredentials {
            access_token: "at".into(),
            ..Default::default()
        });
        assert!(!c.needs_refresh(now, Duration::minutes(30)));

        assert!(!api_key_credential(2, 1).needs_refresh(now, Duration::minutes(30)));
    }

    #[test]
    fn pool_health_follows_error_rate() {
        let mut p = Pool::new("main", ProviderKind::OpenAI);
        assert_eq!(p.error_rate(), 0.0);
        assert!(p.is_healthy());
        p.total_requests = 10;
        p.total_errors = 4;
        assert!(p.is_healthy());
        p.total_errors = 5;
        assert!(!p.is_healthy());
        p.total_errors = 0;
        p.is_active = false;
        assert!(!p.is_healthy());
    }

    #[test]
    fn response_masks_secrets() {
        let c = api_key_credential(7, 1);
        let view = CredentialResponse::from(&c);
        assert_eq!(view.secret_hint, "sk-t****cdef");
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("sk-test-0007-abcdef"));
        assert!(json.contains("\"auth_type\":\"api_key\""));
    }
}
