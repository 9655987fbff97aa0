use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::pools::load_pool;
use crate::error::GatewayError;
use crate::pool::{
    ApiKeyCredentials, AuthType, Credential, CredentialResponse, CredentialSecret, OAuthCredentials,
};
use crate::server::AppState;
use crate::server::util::require_admin;

#[derive(Debug, Deserialize)]
pub struct CredentialCreatePayload {
    pub pool_id: i64,
    pub auth_type: AuthType,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: Option<String>,
    pub account_name: Option<String>,
    pub account_email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub rate_limit: u32,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialUpdatePayload {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: Option<String>,
    pub account_name: Option<String>,
    pub account_email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub weight: Option<u32>,
    pub rate_limit: Option<u32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialQuery {
    pub pool_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CredentialToggleOut {
    pub id: i64,
    pub is_active: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secret_from_payload(payload: &CredentialCreatePayload) -> Result<CredentialSecret, GatewayError> {
    match payload.auth_type {
        AuthType::ApiKey => {
            let key = non_empty(payload.api_key.clone())
                .ok_or_else(|| GatewayError::Parse("api_key is required".into()))?;
            Ok(CredentialSecret::ApiKey(ApiKeyCredentials { key }))
        }
        AuthType::OAuth => {
            let access_token = non_empty(payload.access_token.clone())
                .ok_or_else(|| GatewayError::Parse("access_token is required".into()))?;
            Ok(CredentialSecret::OAuth(OAuthCredentials {
                access_token,
                refresh_token: non_empty(payload.refresh_token.clone()).unwrap_or_default(),
                client_id: non_empty(payload.client_id.clone()),
                client_secret: non_empty(payload.client_secret.clone()),
                region: non_empty(payload.region.clone()),
            }))
        }
    }
}

async fn load_credential(app_state: &AppState, id: i64) -> Result<Credential, GatewayError> {
    app_state
        .credentials
        .get_credential(id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("credential {} not found", id)))
}

pub async fn list_credentials(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CredentialQuery>,
) -> Result<Json<Vec<CredentialResponse>>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let creds = app_state.credentials.list_credentials(query.pool_id).await?;
    Ok(Json(creds.iter().map(CredentialResponse::from).collect()))
}

pub async fn create_credential(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CredentialCreatePayload>,
) -> Result<(StatusCode, Json<CredentialResponse>), GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let pool = load_pool(&app_state, payload.pool_id).await?;
    let secret = secret_from_payload(&payload)?;
    if pool.provider.requires_oauth() && !matches!(secret, CredentialSecret::OAuth(_)) {
        return Err(GatewayError::Parse(format!(
            "{} pools only accept oauth credentials",
            pool.provider
        )));
    }

    let mut credential = Credential::new(pool.id, pool.provider, secret);
    credential.account_name = non_empty(payload.account_name);
    credential.account_email = non_empty(payload.account_email);
    credential.expires_at = payload.expires_at;
    credential.weight = payload.weight.max(1);
    credential.rate_limit = payload.rate_limit;
    credential.is_active = payload.is_active.unwrap_or(true);

    let id = app_state.credentials.create_credential(&credential).await?;
    tracing::info!(credential_id = id, pool_id = pool.id, "Created credential {}", credential.display_name());
    let stored = load_credential(&app_state, id).await?;
    Ok((StatusCode::CREATED, Json(CredentialResponse::from(&stored))))
}

pub async fn get_credential(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<CredentialResponse>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let credential = load_credential(&app_state, id).await?;
    Ok(Json(CredentialResponse::from(&credential)))
}

pub async fn update_credential(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<CredentialUpdatePayload>,
) -> Result<Json<CredentialResponse>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let mut credential = load_credential(&app_state, id).await?;

    match &mut credential.secret {
        CredentialSecret::ApiKey(k) => {
            if let Some(key) = non_empty(payload.api_key) {
                k.key = key;
            }
        }
        CredentialSecret::OAuth(o) => {
            if let Some(v) = non_empty(payload.access_token) {
                o.access_token = v;
            }
            if let Some(v) = non_empty(payload.refresh_token) {
                o.refresh_token = v;
            }
            if let Some(v) = non_empty(payload.client_id) {
                o.client_id = Some(v);
            }
            if let Some(v) = non_empty(payload.client_secret) {
                o.client_secret = Some(v);
            }
            if let Some(v) = non_empty(payload.region) {
                o.region = Some(v);
            }
        }
    }
    if let Some(v) = non_empty(payload.account_name) {
        credential.account_name = Some(v);
    }
    if let Some(v) = non_empty(payload.account_email) {
        credential.account_email = Some(v);
    }
    if payload.expires_at.is_some() {
        credential.expires_at = payload.expires_at;
    }
    if let Some(w) = payload.weight {
        credential.weight = w.max(1);
    }
    if let Some(r) = payload.rate_limit {
        credential.rate_limit = r;
    }
    if let Some(active) = payload.is_active {
        credential.is_active = active;
    }

    app_state.credentials.update_credential(&credential).await?;
    let stored = load_credential(&app_state, id).await?;
    Ok(Json(CredentialResponse::from(&stored)))
}

pub async fn delete_credential(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    if !app_state.credentials.soft_delete_credential(id).await? {
        return Err(GatewayError::NotFound(format!("credential {} not found", id)));
    }
    tracing::info!(credential_id = id, "Soft-deleted credential");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_credential(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<CredentialToggleOut>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let credential = load_credential(&app_state, id).await?;
    let is_active = !credential.is_active;
    app_state.credentials.set_credential_active(id, is_active).await?;
    Ok(Json(CredentialToggleOut { id, is_active }))
}

/// OAuth 凭据立即刷新令牌，API key 凭据立即做一次健康探测
pub async fn refresh_credential(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<CredentialResponse>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let credential = load_credential(&app_state, id).await?;
    let pool = app_state.pools.get_pool(credential.pool_id).await?;
    app_state
        .refresh
        .force_refresh(&credential, pool.as_ref())
        .await?;
    let stored = load_credential(&app_state, id).await?;
    Ok(Json(CredentialResponse::from(&stored)))
}
