use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::canonical::{ChatRequest, ChatResponse};

/// 每次上游尝试一条，写入后不再修改
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub credential_id: Option<i64>,
    pub pool_id: Option<i64>,
    pub provider: String,
    pub model: String,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub stream: bool,
    pub cached: bool,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub pool_id: Option<i64>,
    pub credential_id: Option<i64>,
    pub errors_only: bool,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: i64,
    pub cache_key: String,
    pub model: String,
    pub query_text: String,
    pub embedding: Option<Vec<f64>>,
    pub request: ChatRequest,
    pub response: ChatResponse,
    pub tokens_saved: u32,
    pub hit_count: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolCredentialCounts {
    pub total: i64,
    pub active: i64,
    pub healthy: i64,
    pub unhealthy: i64,
    pub unknown: i64,
}
