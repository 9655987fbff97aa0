//! 外部账号管理工具导出的账号批量导入

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{AccountProfile, Credential, CredentialSecret, HealthStatus, OAuthCredentials, Pool};
use crate::error::{GatewayError, Result};
use crate::logging::time::from_millis;
use crate::server::storage_traits::CredentialStore;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedAccount {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub idp: Option<String>,
    #[serde(default)]
    pub credentials: ExportedCredentials,
    #[serde(default)]
    pub subscription: ExportedSubscription,
    #[serde(default)]
    pub usage: ExportedUsage,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedCredentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// 毫秒时间戳
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub auth_method: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSubscription {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedUsage {
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub limit: f64,
    #[serde(default)]
    pub percent_used: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchImportRequest {
    pub pool_id: i64,
    pub accounts: Vec<ExportedAccount>,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub rate_limit: u32,
}

/// 账号列表以 JSON 字符串形式提交
#[derive(Debug, Deserialize)]
pub struct BatchImportJsonRequest {
    pub pool_id: i64,
    pub json_data: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub rate_limit: u32,
}

impl BatchImportJsonRequest {
    pub fn into_request(self) -> Result<BatchImportRequest> {
        let accounts: Vec<ExportedAccount> = serde_json::from_str(&self.json_data)
            .map_err(|e| GatewayError::Parse(format!("failed to parse JSON: {}", e)))?;
        Ok(BatchImportRequest {
            pool_id: self.pool_id,
            accounts,
            weight: self.weight,
            rate_limit: self.rate_limit,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchImportResponse {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub created_ids: Vec<i64>,
}

/// 导出记录 -> 凭证（尚未入库）
pub fn to_credential(
    pool: &Pool,
    account: &ExportedAccount,
    weight: u32,
    rate_limit: u32,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let creds = &account.credentials;
    if creds.access_token.trim().is_empty() {
        return Err(GatewayError::Parse("missing access token".into()));
    }

    let subscription_expires_at = from_millis(account.subscription.expires_at);
    let days_remaining = (account.subscription.expires_at > 0)
        .then(|| (account.subscription.expires_at - now.timestamp_millis()) / MILLIS_PER_DAY);
    let usage_percent = if account.usage.limit > 0.0 {
        Some(account.usage.current / account.usage.limit * 100.0)
    } else {
        account.usage.percent_used
    };

    let mut credential = Credential::new(
        pool.id,
        pool.provider,
        CredentialSecret::OAuth(OAuthCredentials {
            access_token: creds.access_token.clone(),
            refresh_token: creds.refresh_token.clone(),
            client_id: creds.client_id.clone().filter(|s| !s.is_empty()),
            client_secret: creds.client_secret.clone().filter(|s| !s.is_empty()),
            region: creds.region.clone().filter(|s| !s.is_empty()),
        }),
    );
    credential.account_name = account.nickname.clone().filter(|s| !s.is_empty());
    credential.account_email = Some(account.email.trim().to_string()).filter(|s| !s.is_empty());
    credential.expires_at = from_millis(creds.expires_at);
    credential.weight = weight.max(1);
    credential.rate_limit = rate_limit;
    // 缺省 status 视为 active
    credential.is_active = account.status.as_deref().is_none_or(|s| s == "active");
    credential.health_status = HealthStatus::Unknown;
    credential.profile = AccountProfile {
        user_id: account.user_id.clone(),
        nickname: account.nickname.clone(),
        idp: account.idp.clone(),
        subscription_type: account.subscription.kind.clone(),
        subscription_title: account.subscription.title.clone(),
        subscription_expires_at,
        days_remaining,
        usage_current: (account.usage.limit > 0.0).then_some(account.usage.current),
        usage_limit: (account.usage.limit > 0.0).then_some(account.usage.limit),
        usage_percent,
    };
    Ok(credential)
}

/// 导出的账号是 AWS OIDC 令牌，只有 Kiro 池能用
pub fn ensure_import_target(pool: &Pool) -> Result<()> {
    if pool.provider.requires_oauth() {
        return Ok(());
    }
    Err(GatewayError::Parse(format!(
        "pool {} serves {}; exported accounts can only be imported into a kiro pool",
        pool.id, pool.provider
    )))
}

/// 逐条导入；单条失败只记入 errors，不影响其余记录
pub async fn batch_import(
    store: &dyn CredentialStore,
    pool: &Pool,
    request: &BatchImportRequest,
) -> Result<BatchImportResponse> {
    ensure_import_target(pool)?;
    let now = Utc::now();
    let mut response = BatchImportResponse {
        total: request.accounts.len(),
        ..Default::default()
    };

    for (i, account) in request.accounts.iter().enumerate() {
        let created = match to_credential(pool, account, request.weight, request.rate_limit, now) {
            Ok(c) => store.create_credential(&c).await,
            Err(e) => Err(e),
        };
        match created {
            Ok(id) => {
                response.success += 1;
                response.created_ids.push(id);
            }
            Err(e) => {
                response.failed += 1;
                response
                    .errors
                    .push(format!("Account {} ({}): {}", i + 1, account.email, e));
            }
        }
    }

    tracing::info!(
        "Batch import into pool {}: {} ok, {} failed",
        pool.id,
        response.success,
        response.failed
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::logging::database::tests::temp_logger;
    use chrono::Duration;

    fn exported(email: &str) -> ExportedAccount {
        serde_json::from_value(serde_json::json!({
            "email": email,
            "userId": "u-1",
            "nickname": "Nick",
            "idp": "BuilderId",
            "credentials": {
                "accessToken": "aoa-access",
                "refreshToken": "aor-refresh",
                "clientId": "cid",
                "clientSecret": "csecret",
                "region": "us-east-1",
                "expiresAt": 1_900_000_000_000i64,
                "authMethod": "IdC",
                "provider": "BuilderId"
            },
            "subscription": {"type": "PRO", "title": "Pro", "expiresAt": 1_900_000_000_000i64},
            "usage": {"current": 25, "limit": 100, "percentUsed": 25.0},
            "status": "active"
        }))
        .unwrap()
    }

    fn pool() -> Pool {
        let mut p = Pool::new("imported", ProviderKind::Kiro);
        p.id = 7;
        p
    }

    #[test]
    fn conversion_normalizes_profile_and_defaults() {
        let now = from_millis(1_900_000_000_000).unwrap() - Duration::days(10);
        let c = to_credential(&pool(), &exported("a@example.com"), 0, 20, now).unwrap();
        assert_eq!(c.pool_id, 7);
        assert_eq!(c.provider, ProviderKind::Kiro);
        assert_eq!(c.weight, 1);
        assert_eq!(c.rate_limit, 20);
        assert_eq!(c.health_status, HealthStatus::Unknown);
        assert!(c.is_active);
        assert_eq!(c.profile.days_remaining, Some(10));
        assert_eq!(c.profile.usage_percent, Some(25.0));
        let oauth = c.secret.oauth().unwrap();
        assert_eq!(oauth.client_pair(), Some(("cid", "csecret")));
        assert_eq!(c.expires_at, from_millis(1_900_000_000_000));

        let mut disabled = exported("b@example.com");
        disabled.status = Some("suspended".into());
        assert!(!to_credential(&pool(), &disabled, 2, 0, now).unwrap().is_active);
        let mut no_status = exported("c@example.com");
        no_status.status = None;
        assert!(to_credential(&pool(), &no_status, 2, 0, now).unwrap().is_active);
    }

    #[test]
    fn json_variant_rejects_garbage() {
        let req = BatchImportJsonRequest {
            pool_id: 1,
            json_data: "not json".into(),
            weight: 0,
            rate_limit: 0,
        };
        assert!(matches!(req.into_request(), Err(GatewayError::Parse(_))));
    }

    #[tokio::test]
    async fn duplicates_fail_individually_without_aborting() {
        let (_dir, db) = temp_logger().await;
        let accounts = vec![
            exported("one@example.com"),
            exported("two@example.com"),
            exported("one@example.com"),
            ExportedAccount {
                email: "empty@example.com".into(),
                ..Default::default()
            },
            exported("three@example.com"),
            exported("two@example.com"),
        ];
        let n = accounts.len();
        let request = BatchImportRequest {
            pool_id: 7,
            accounts,
            weight: 3,
            rate_limit: 0,
        };
        let resp = batch_import(&db, &pool(), &request).await.unwrap();

        assert_eq!(resp.total, n);
        assert_eq!(resp.success + resp.failed, n);
        assert_eq!(resp.failed, 3);
        assert_eq!(resp.created_ids.len(), 3);
        assert!(resp.errors[0].starts_with("Account 3 (one@example.com): "));
        assert!(resp.errors[1].starts_with("Account 4 (empty@example.com): "));

        let stored = db.list_credentials(Some(7)).await.unwrap();
        let mut emails: Vec<_> = stored.iter().filter_map(|c| c.account_email.clone()).collect();
        emails.sort();
        assert_eq!(emails, vec!["one@example.com", "three@example.com", "two@example.com"]);
        assert!(stored.iter().all(|c| c.weight == 3));
    }

    #[tokio::test]
    async fn accounts_only_land_in_kiro_pools() {
        let (_dir, db) = temp_logger().await;
        let mut anthropic = Pool::new("claude", ProviderKind::Anthropic);
        anthropic.id = 3;
        let request = BatchImportRequest {
            pool_id: 3,
            accounts: vec![exported("x@example.com")],
            weight: 1,
            rate_limit: 0,
        };
        let err = batch_import(&db, &anthropic, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Parse(ref m) if m.contains("kiro pool")));
        assert!(db.list_credentials(Some(3)).await.unwrap().is_empty());
        assert!(ensure_import_target(&pool()).is_ok());
    }
}
