use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::logging::{LogFilter, RequestLog};
use crate::server::AppState;
use crate::server::util::require_admin;

#[derive(Debug, Deserialize, Default)]
pub struct LogsQuery {
    #[serde(default)]
    pub pool_id: Option<i64>,
    #[serde(default)]
    pub credential_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>, // success | error
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RequestLogEntry {
    #[serde(flatten)]
    pub log: RequestLog,
    pub success: bool,
}

/// 最新在前
pub async fn list_request_logs(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<RequestLogEntry>>, GatewayError> {
    require_admin(&headers, &app_state.config.server)?;
    let filter = LogFilter {
        pool_id: q.pool_id,
        credential_id: q.credential_id,
        errors_only: q.status.as_deref() == Some("error"),
        limit: q.limit.unwrap_or(0),
    };
    let mut logs = app_state.logs.recent_logs(&filter).await?;
    if q.status.as_deref() == Some("success") {
        logs.retain(|l| l.status_code < 400);
    }
    Ok(Json(
        logs.into_iter()
            .map(|log| RequestLogEntry {
                success: log.status_code < 400,
                log,
            })
            .collect(),
    ))
}
