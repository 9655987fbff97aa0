use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ProviderKind;
use crate::error::GatewayError;
use crate::logging::PoolCredentialCounts;
use crate::pool::Pool;
use crate::pool::import::{BatchImportJsonRequest, BatchImportRequest, BatchImportResponse, batch_import};
use crate::routing::SelectionStrategy;
use crate::server::AppState;
use crate::server::util::require_admin;

#[derive(Debug, Deserialize)]
pub struct PoolCreatePayload {
    pub name: String,
    pub provider: String,
    pub description: Option<String>,
    pub strategy: Option<String>,
    pub health_check_interval: Option<u64>,
    pub health_check_timeout: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolUpdatePayload {
    pub name: Option<String>,
    pub description: Option<String>,
    pub strategy: Option<String>,
    pub health_check_interval: Option<u64>,
    pub health_check_timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PoolToggleOut {
    pub id: i64,
    pub is_active: bool,
}

#[derive(Debug, Serialize)]
pub struct PoolStatsOut {
    pub pool_id: i64,
    pub name: String,
    pub provider: ProviderKind,
    pub total_requests: i64,
    pub total_errors: i64,
    pub error_rate: f64,
    pub is_healthy: bool,
    pub credentials: PoolCredentialCounts,
}

/// 只接受规范名称，不接受别名
fn parse_provider(value: &str) -> Result<ProviderKind, GatewayError> {
    let wanted = value.trim();
    ProviderKind::ALL
        .into_iter()
        .find(|k| k.as_str() == wanted)
        .ok_or_else(|| {
            GatewayError::Parse(format!(
                "invalid provider '{}', expected openai, anthropic, gemini or kiro",
                value
            ))
        })
}

fn parse_strategy(value: &str) -> Result<SelectionStrategy, GatewayError> {
    SelectionStrategy::parse(value).ok_or_else(|| {
        GatewayError::Parse(format!(
            "invalid strategy '{}', expected round_robin, weighted_round_robin, least_connections or random",
            value
        ))
    })
}

pub(super) async fn load_pool(app_state: &AppState, id: i64) -> Result<Pool, GatewayError> {
    app_state
        .pools
        .get_pool(id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("pool {} not found", id)))
}

pub async fn list_pools(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Pool>>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    Ok(Json(app_state.pools.list_pools().await?))
}

pub async fn create_pool(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PoolCreatePayload>,
) -> Result<(StatusCode, Json<Pool>), GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    if payload.name.trim().is_empty() {
        return Err(GatewayError::Parse("pool name is required".into()));
    }
    let mut pool = Pool::new(payload.name.trim(), parse_provider(&payload.provider)?);
    pool.description = payload.description;
    if let Some(s) = payload.strategy.as_deref() {
        pool.strategy = parse_strategy(s)?;
    }
    if let Some(v) = payload.health_check_interval.filter(|v| *v > 0) {
        pool.health_check_interval_secs = v;
    }
    if let Some(v) = payload.health_check_timeout.filter(|v| *v > 0) {
        pool.health_check_timeout_secs = v;
    }
    if let Some(v) = payload.max_retries {
        pool.max_retries = v;
    }

    let id = app_state.pools.create_pool(&pool).await?;
    tracing::info!(pool_id = id, provider = %pool.provider, "Created pool '{}'", pool.name);
    Ok((StatusCode::CREATED, Json(load_pool(&app_state, id).await?)))
}

pub async fn get_pool(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Pool>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    Ok(Json(load_pool(&app_state, id).await?))
}

pub async fn update_pool(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<PoolUpdatePayload>,
) -> Result<Json<Pool>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let mut pool = load_pool(&app_state, id).await?;
    if let Some(name) = payload.name.filter(|n| !n.trim().is_empty()) {
        pool.name = name.trim().to_string();
    }
    if payload.description.is_some() {
        pool.description = payload.description;
    }
    if let Some(s) = payload.strategy.as_deref() {
        pool.strategy = parse_strategy(s)?;
    }
    if let Some(v) = payload.health_check_interval.filter(|v| *v > 0) {
        pool.health_check_interval_secs = v;
    }
    if let Some(v) = payload.health_check_timeout.filter(|v| *v > 0) {
        pool.health_check_timeout_secs = v;
    }
    if let Some(v) = payload.max_retries {
        pool.max_retries = v;
    }
    if let Some(active) = payload.is_active {
        pool.is_active = active;
    }
    app_state.pools.update_pool(&pool).await?;
    Ok(Json(load_pool(&app_state, id).await?))
}

pub async fn delete_pool(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    if !app_state.pools.delete_pool(id).await? {
        return Err(GatewayError::NotFound(format!("pool {} not found", id)));
    }
    tracing::info!(pool_id = id, "Deleted pool and its credentials");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_pool(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<PoolToggleOut>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let pool = load_pool(&app_state, id).await?;
    let is_active = !pool.is_active;
    app_state.pools.set_pool_active(id, is_active).await?;
    Ok(Json(PoolToggleOut { id, is_active }))
}

pub async fn pool_stats(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<PoolStatsOut>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let pool = load_pool(&app_state, id).await?;
    let credentials = app_state.pools.credential_counts(id).await?;
    Ok(Json(PoolStatsOut {
        pool_id: pool.id,
        error_rate: pool.error_rate(),
        is_healthy: pool.is_healthy(),
        name: pool.name,
        provider: pool.provider,
        total_requests: pool.total_requests,
        total_errors: pool.total_errors,
        credentials,
    }))
}

pub async fn batch_import_accounts(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<BatchImportRequest>,
) -> Result<Json<BatchImportResponse>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let pool = load_pool(&app_state, payload.pool_id).await?;
    Ok(Json(batch_import(app_state.credentials.as_ref(), &pool, &payload).await?))
}

pub async fn batch_import_accounts_json(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<BatchImportJsonRequest>,
) -> Result<Json<BatchImportResponse>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let request = payload.into_request()?;
    let pool = load_pool(&app_state, request.pool_id).await?;
    Ok(Json(batch_import(app_state.credentials.as_ref(), &pool, &request).await?))
}
