use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::server::AppState;
use crate::server::util::{mask_key, require_admin};

#[derive(Debug, Deserialize)]
pub struct QuotaGrantPayload {
    /// 调用方的 bearer token
    pub user: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct QuotaOut {
    pub user: String,
    pub remaining: i64,
}

pub async fn grant_quota(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<QuotaGrantPayload>,
) -> Result<Json<QuotaOut>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let user = payload.user.trim();
    if user.is_empty() {
        return Err(GatewayError::Parse("user is required".into()));
    }
    if payload.amount <= 0 {
        return Err(GatewayError::Parse("amount must be positive".into()));
    }
    let remaining = app_state.quota.quota_grant(user, payload.amount).await?;
    tracing::info!(user = %mask_key(user), amount = payload.amount, remaining, "Granted quota");
    Ok(Json(QuotaOut {
        user: user.to_string(),
        remaining,
    }))
}

pub async fn get_quota(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> Result<Json<QuotaOut>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let remaining = app_state.quota.quota_remaining(&user).await?.unwrap_or(0);
    Ok(Json(QuotaOut { user, remaining }))
}
