use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// 入站请求格式错误，不重试
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No eligible credential for provider '{provider}'")]
    NoEligibleCredential { provider: String },

    #[error("Upstream error: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("Refresh error: {0}")]
    Refresh(String),

    #[error("Cache error: {0}")]
    Cache(String),

    /// 响应转换失败，说明转换器本身有缺陷
    #[error("Format error: {0}")]
    Format(String),

    #[error("Insufficient quota: {0}")]
    QuotaExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Parse(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            Self::NoEligibleCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } | Self::Http(_) | Self::Refresh(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cache(_)
            | Self::Format(_)
            | Self::Db(_)
            | Self::Io(_)
            | Self::TimeParse(_)
            | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "invalid_request",
            Self::Json(_) => "invalid_json",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::QuotaExceeded(_) => "insufficient_quota",
            Self::NoEligibleCredential { .. } => "no_eligible_credential",
            Self::Upstream { .. } | Self::Http(_) => "upstream_error",
            Self::Refresh(_) => "refresh_failed",
            Self::Timeout(_) => "upstream_timeout",
            Self::Cache(_) => "cache_error",
            Self::Format(_) => "format_error",
            Self::Db(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::TimeParse(_) => "time_parse_error",
            Self::Config(_) => "config_error",
        }
    }

    /// 上游因请求本身拒绝（400/404/413/422 等），换凭据也不会成功，也不算凭据的错
    pub fn is_request_fault(&self) -> bool {
        match self {
            Self::Upstream { status: Some(s), .. } => {
                (400..500).contains(s) && !matches!(s, 401 | 402 | 403 | 408 | 429)
            }
            _ => false,
        }
    }

    /// 上游失败可以换一个凭据重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Http(_) | Self::Timeout(_)
        ) && !self.is_request_fault()
    }

    fn details(&self) -> Value {
        match self {
            Self::Upstream { status, .. } => json!({ "upstream_status": status }),
            Self::NoEligibleCredential { provider } => json!({ "provider": provider, "retryable": true }),
            _ => Value::Null,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        }
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
            "details": self.details(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status() {
        assert_eq!(GatewayError::Parse("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::NoEligibleCredential { provider: "openai".into() }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GatewayError::upstream(Some(500), "boom").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::Format("bad".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(GatewayError::upstream(None, "reset").is_retryable());
        assert!(!GatewayError::Parse("x".into()).is_retryable());
    }

    #[test]
    fn client_side_upstream_rejections_are_not_retried() {
        for status in [400, 404, 413, 422] {
            let err = GatewayError::upstream(Some(status), "bad request");
            assert!(err.is_request_fault(), "{status}");
            assert!(!err.is_retryable(), "{status}");
        }
        for status in [401, 402, 403, 408, 429, 500, 503] {
            let err = GatewayError::upstream(Some(status), "credential or upstream fault");
            assert!(!err.is_request_fault(), "{status}");
            assert!(err.is_retryable(), "{status}");
        }
        assert!(!GatewayError::upstream(None, "reset").is_request_fault());
        assert!(!GatewayError::Timeout("t".into()).is_request_fault());
    }

    #[tokio::test]
    async fn error_body_is_structured() {
        let resp = GatewayError::NoEligibleCredential { provider: "gemini".into() }.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["code"], "no_eligible_credential");
        assert_eq!(v["details"]["provider"], "gemini");
        assert!(v["message"].as_str().unwrap().contains("gemini"));
    }
}
