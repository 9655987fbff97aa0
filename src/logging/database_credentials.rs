use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};

use super::database::DatabaseLogger;
use super::time::{column_time, column_time_opt, to_db_opt, to_db_string};
use crate::config::ProviderKind;
use crate::error::{GatewayError, Result};
use crate::pool::{
    AccountProfile, ApiKeyCredentials, AuthType, Credential, CredentialSecret, HealthStatus,
    OAuthCredentials,
};
use crate::server::storage_traits::CredentialStore;

const CREDENTIAL_COLUMNS: &str = "id, pool_id, provider, auth_type, api_key, access_token, refresh_token,
    client_id, client_secret, region, account_name, account_email, profile, expires_at, weight,
    is_active, health_status, last_error, last_used_at, total_requests, total_errors, rate_limit,
    current_usage, rate_limit_reset_at, created_at, updated_at";

/// 一分钟固定窗口
const RATE_LIMIT_WINDOW_SECS: i64 = 60;

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(GatewayError::Config(msg)),
    )
}

fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
    let provider_s: String = row.get(2)?;
    let provider = ProviderKind::parse(&provider_s)
        .ok_or_else(|| conversion_error(2, format!("unknown provider '{}'", provider_s)))?;
    let auth_s: String = row.get(3)?;
    let secret = match AuthType::from_db_value(&auth_s) {
        Some(AuthType::ApiKey) => CredentialSecret::ApiKey(ApiKeyCredentials {
            key: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        }),
        Some(AuthType::OAuth) => CredentialSecret::OAuth(OAuthCredentials {
            access_token: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            refresh_token: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            client_id: row.get(7)?,
            client_secret: row.get(8)?,
            region: row.get(9)?,
        }),
        None => return Err(conversion_error(3, format!("unknown auth type '{}'", auth_s))),
    };
    // profile 列损坏时按空处理，不影响凭证本身可用
    let profile = row
        .get::<_, Option<String>>(12)?
        .and_then(|s| serde_json::from_str::<AccountProfile>(&s).ok())
        .unwrap_or_default();
    let health: Option<String> = row.get(16)?;

    Ok(Credential {
        id: row.get(0)?,
        pool_id: row.get(1)?,
        provider,
        secret,
        account_name: row.get(10)?,
        account_email: row.get(11)?,
        profile,
        expires_at: column_time_opt(row.get(13)?, 13)?,
        weight: row.get(14)?,
        is_active: row.get::<_, i64>(15)? != 0,
        health_status: HealthStatus::from_db_value(health.as_deref()),
        last_error: row.get(17)?,
        last_used_at: column_time_opt(row.get(18)?, 18)?,
        total_requests: row.get(19)?,
        total_errors: row.get(20)?,
        rate_limit: row.get(21)?,
        current_usage: row.get(22)?,
        rate_limit_reset_at: column_time_opt(row.get(23)?, 23)?,
        created_at: column_time(row.get(24)?, 24)?,
        updated_at: column_time(row.get(25)?, 25)?,
    })
}

/// 拆成各列：(api_key, access_token, refresh_token, client_id, client_secret, region)
type SecretColumns = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn secret_columns(secret: &CredentialSecret) -> SecretColumns {
    match secret {
        CredentialSecret::ApiKey(k) => (Some(k.key.clone()), None, None, None, None, None),
        CredentialSecret::OAuth(o) => (
            None,
            Some(o.access_token.clone()),
            Some(o.refresh_token.clone()),
            o.client_id.clone(),
            o.client_secret.clone(),
            o.region.clone(),
        ),
    }
}

fn profile_json(profile: &AccountProfile) -> Result<Option<String>> {
    if *profile == AccountProfile::default() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(profile)?))
}

impl DatabaseLogger {
    async fn query_credentials(
        &self,
        filter: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Credential>> {
        let conn = self.connection.lock().await;
        let sql = format!(
            "SELECT {} FROM credentials WHERE deleted_at IS NULL {} ORDER BY id",
            CREDENTIAL_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_credential)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn touch_credential(&self, sql: &str, id: i64, extra: Option<&str>) -> Result<usize> {
        let conn = self.connection.lock().await;
        let now = to_db_string(&Utc::now());
        let n = match extra {
            Some(v) => conn.execute(sql, params![id, now, v])?,
            None => conn.execute(sql, params![id, now])?,
        };
        Ok(n)
    }
}

#[async_trait]
impl CredentialStore for DatabaseLogger {
    async fn create_credential(&self, c: &Credential) -> Result<i64> {
        let (api_key, access, refresh, client_id, client_secret, region) = secret_columns(&c.secret);
        let profile = profile_json(&c.profile)?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO credentials (
                pool_id, provider, auth_type, api_key, access_token, refresh_token,
                client_id, client_secret, region, account_name, account_email, profile,
                expires_at, weight, is_active, health_status, last_error, rate_limit,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                c.pool_id,
                c.provider.as_str(),
                c.auth_type().as_db_value(),
                api_key,
                access,
                refresh,
                client_id,
                client_secret,
                region,
                c.account_name,
                c.account_email,
                profile,
                to_db_opt(&c.expires_at),
                c.weight.max(1),
                c.is_active as i64,
                c.health_status.as_db_value(),
                c.last_error,
                c.rate_limit,
                to_db_string(&c.created_at),
                to_db_string(&c.updated_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_credential(&self, c: &Credential) -> Result<()> {
        let (api_key, access, refresh, client_id, client_secret, region) = secret_columns(&c.secret);
        let profile = profile_json(&c.profile)?;
        let conn = self.connection.lock().await;
        let n = conn.execute(
            "UPDATE credentials SET
                pool_id = ?2, provider = ?3, auth_type = ?4, api_key = ?5, access_token = ?6,
                refresh_token = ?7, client_id = ?8, client_secret = ?9, region = ?10,
                account_name = ?11, account_email = ?12, profile = ?13, expires_at = ?14,
                weight = ?15, is_active = ?16, health_status = ?17, last_error = ?18,
                rate_limit = ?19, updated_at = ?20
             WHERE id = ?1 AND deleted_at IS NULL",
            params![
                c.id,
                c.pool_id,
                c.provider.as_str(),
                c.auth_type().as_db_value(),
                api_key,
                access,
                refresh,
                client_id,
                client_secret,
                region,
                c.account_name,
                c.account_email,
                profile,
                to_db_opt(&c.expires_at),
                c.weight.max(1),
                c.is_active as i64,
                c.health_status.as_db_value(),
                c.last_error,
                c.rate_limit,
                to_db_string(&Utc::now()),
            ],
        )?;
        if n == 0 {
            return Err(GatewayError::NotFound(format!("credential {}", c.id)));
        }
        Ok(())
    }

    async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let conn = self.connection.lock().await;
        let sql = format!(
            "SELECT {} FROM credentials WHERE id = ?1 AND deleted_at IS NULL",
            CREDENTIAL_COLUMNS
        );
        let c = conn.query_row(&sql, [id], row_to_credential).optional()?;
        Ok(c)
    }

    async fn list_credentials(&self, pool_id: Option<i64>) -> Result<Vec<Credential>> {
        match pool_id {
            Some(pid) => self.query_credentials("AND pool_id = ?1", vec![pid.into()]).await,
            None => self.query_credentials("", Vec::new()).await,
        }
    }

    async fn find_active_by_pool(&self, pool_id: i64) -> Result<Vec<Credential>> {
        self.query_credentials("AND pool_id = ?1 AND is_active = 1", vec![pool_id.into()])
            .await
    }

    async fn find_active_by_provider(&self, provider: ProviderKind) -> Result<Vec<Credential>> {
        let p = provider.as_str().to_string();
        self.query_credentials("AND provider = ?1 AND is_active = 1", vec![p.into()])
            .await
    }

    async fn find_expiring_soon(
        &self,
        provider: Option<ProviderKind>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Credential>> {
        let before = to_db_string(&before);
        let base = "AND auth_type = 'oauth' AND is_active = 1
            AND refresh_token IS NOT NULL AND refresh_token != ''
            AND expires_at IS NOT NULL AND expires_at <= ?1";
        match provider {
            Some(p) => {
                let args = vec![before.into(), p.as_str().to_string().into()];
                self.query_credentials(&format!("{} AND provider = ?2", base), args)
                    .await
            }
            None => self.query_credentials(base, vec![before.into()]).await,
        }
    }

    async fn increment_usage(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.connection.lock().await;
        let now_s = to_db_string(&now);
        let reset_s = to_db_string(&(now + Duration::seconds(RATE_LIMIT_WINDOW_SECS)));
        // 窗口已过期则从 1 重新计数，整条在一个 UPDATE 里完成
        conn.execute(
            "UPDATE credentials SET
                total_requests = total_requests + 1,
                current_usage = CASE
                    WHEN rate_limit_reset_at IS NULL OR rate_limit_reset_at < ?2 THEN 1
                    ELSE current_usage + 1 END,
                rate_limit_reset_at = CASE
                    WHEN rate_limit_reset_at IS NULL OR rate_limit_reset_at < ?2 THEN ?3
                    ELSE rate_limit_reset_at END,
                last_used_at = ?2,
                updated_at = ?2
             WHERE id = ?1",
            params![id, now_s, reset_s],
        )?;
        Ok(())
    }

    async fn increment_errors(&self, id: i64, error: &str) -> Result<()> {
        self.touch_credential(
            "UPDATE credentials SET
                total_errors = total_errors + 1,
                last_error = ?3,
                health_status = CASE
                    WHEN (total_errors + 1) * 2 > total_requests THEN 'unhealthy'
                    ELSE health_status END,
                updated_at = ?2
             WHERE id = ?1",
            id,
            Some(error),
        )
        .await?;
        Ok(())
    }

    async fn record_success(&self, id: i64) -> Result<()> {
        self.touch_credential(
            "UPDATE credentials SET health_status = 'healthy', last_error = NULL, updated_at = ?2
             WHERE id = ?1",
            id,
            None,
        )
        .await?;
        Ok(())
    }

    async fn set_health(&self, id: i64, status: HealthStatus, error: Option<&str>) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE credentials SET health_status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_db_value(), error, to_db_string(&Utc::now())],
        )?;
        Ok(())
    }

    async fn apply_refresh(
        &self,
        id: i64,
        tokens: &OAuthCredentials,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE credentials SET
                access_token = ?2, refresh_token = ?3, expires_at = ?4,
                health_status = 'healthy', last_error = NULL, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                tokens.access_token,
                tokens.refresh_token,
                to_db_opt(&expires_at),
                to_db_string(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    async fn set_credential_active(&self, id: i64, active: bool) -> Result<bool> {
        let conn = self.connection.lock().await;
        let n = conn.execute(
            "UPDATE credentials SET is_active = ?2, updated_at = ?3 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, active as i64, to_db_string(&Utc::now())],
        )?;
        Ok(n > 0)
    }

    async fn soft_delete_credential(&self, id: i64) -> Result<bool> {
        let n = self
            .touch_credential(
                "UPDATE credentials SET deleted_at = ?2, is_active = 0, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                id,
                None,
            )
            .await?;
        Ok(n > 0)
    }
}
