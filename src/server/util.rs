use axum::http::HeaderMap;

use crate::config::ServerConfig;
use crate::error::GatewayError;

// HTTP helpers
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// 调用方身份：Bearer 优先，其次 Anthropic/Gemini SDK 习惯的头
pub fn client_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| {
        ["x-api-key", "x-goog-api-key"].iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
    })
}

/// 未配置 admin_token 时管理接口不设防（启动时已告警）
pub fn require_admin(headers: &HeaderMap, server: &ServerConfig) -> Result<(), GatewayError> {
    let Some(expected) = server.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(provided) if provided == expected => Ok(()),
        Some(_) => Err(GatewayError::Unauthorized("invalid admin token".into())),
        None => Err(GatewayError::Unauthorized("missing bearer token".into())),
    }
}

// Key masking for logs and API responses
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let start: String = chars[..4].iter().collect();
    let end: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", start, end)
}
