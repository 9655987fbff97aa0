//! 每次尝试的收尾：计数、额度扣减、请求日志

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::GatewayError;
use crate::logging::RequestLog;
use crate::protocol::canonical::Usage;
use crate::server::storage_traits::{CredentialStore, PoolStore, QuotaStore, RequestLogStore};

/// 客户端断开时记录的状态码
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// 一次上游尝试（或缓存命中 / 选不到凭据）的上下文
#[derive(Debug, Clone)]
pub struct Attempt {
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub credential_id: Option<i64>,
    pub pool_id: Option<i64>,
    pub provider: String,
    pub model: String,
    pub path: String,
    pub protocol: String,
    pub stream: bool,
    pub user: Option<String>,
}

impl Attempt {
    pub fn log(
        &self,
        status_code: u16,
        usage: Option<Usage>,
        error_message: Option<String>,
        cached: bool,
    ) -> RequestLog {
        RequestLog {
            id: None,
            timestamp: self.started_at,
            credential_id: self.credential_id,
            pool_id: self.pool_id,
            provider: self.provider.clone(),
            model: self.model.clone(),
            method: "POST".to_string(),
            path: self.path.clone(),
            protocol: self.protocol.clone(),
            stream: self.stream,
            cached,
            status_code,
            response_time_ms: self.started.elapsed().as_millis() as i64,
            prompt_tokens: usage.map(|u| u.prompt_tokens),
            completion_tokens: usage.map(|u| u.completion_tokens),
            total_tokens: usage.map(|u| u.total_tokens),
            error_message,
        }
    }

    pub fn for_credential(&self, pool_id: i64, credential_id: i64) -> Self {
        let mut a = self.clone();
        a.started_at = Utc::now();
        a.started = Instant::now();
        a.pool_id = Some(pool_id);
        a.credential_id = Some(credential_id);
        a
    }
}

/// 失败时写入日志的状态码：优先上游原始状态
pub fn status_for(err: &GatewayError) -> u16 {
    match err {
        GatewayError::Upstream {
            status: Some(s), ..
        } => *s,
        other => other.status_code().as_u16(),
    }
}

#[derive(Clone)]
pub struct Recorder {
    pub credentials: Arc<dyn CredentialStore>,
    pub pools: Arc<dyn PoolStore>,
    pub logs: Arc<dyn RequestLogStore>,
    pub quota: Arc<dyn QuotaStore>,
    pub quota_enabled: bool,
}

impl Recorder {
    /// 尝试开始：凭据限流窗口 +1，池请求数 +1
    pub async fn begin(&self, attempt: &Attempt) {
        let now = Utc::now();
        if let Some(id) = attempt.credential_id
            && let Err(e) = self.credentials.increment_usage(id, now).await
        {
            tracing::warn!(credential_id = id, "Failed to increment usage: {}", e);
        }
        if let Some(pool_id) = attempt.pool_id
            && let Err(e) = self.pools.increment_pool_requests(pool_id).await
        {
            tracing::warn!(pool_id, "Failed to increment pool requests: {}", e);
        }
    }

    pub async fn success(&self, attempt: &Attempt, usage: Usage) {
        if let Some(id) = attempt.credential_id
            && let Err(e) = self.credentials.record_success(id).await
        {
            tracing::warn!(credential_id = id, "Failed to record success: {}", e);
        }
        self.deduct(attempt, usage).await;
        self.write(attempt.log(200, Some(usage), None, false)).await;
    }

    /// 请求本身的错误只记日志，不计入凭据和池的错误数
    pub async fn failure(&self, attempt: &Attempt, err: &GatewayError) {
        let message = err.to_string();
        if err.is_request_fault() {
            tracing::info!(
                provider = %attempt.provider,
                model = %attempt.model,
                credential_id = ?attempt.credential_id,
                "Upstream rejected the request: {}",
                message
            );
            self.write(attempt.log(status_for(err), None, Some(message), false))
                .await;
            return;
        }
        if let Some(id) = attempt.credential_id
            && let Err(e) = self.credentials.increment_errors(id, &message).await
        {
            tracing::warn!(credential_id = id, "Failed to increment errors: {}", e);
        }
        if let Some(pool_id) = attempt.pool_id
            && let Err(e) = self.pools.increment_pool_errors(pool_id).await
        {
            tracing::warn!(pool_id, "Failed to increment pool errors: {}", e);
        }
        tracing::warn!(
            provider = %attempt.provider,
            model = %attempt.model,
            credential_id = ?attempt.credential_id,
            "Upstream attempt failed: {}",
            message
        );
        self.write(attempt.log(status_for(err), None, Some(message), false))
            .await;
    }

    /// 选不到凭据等没有上游调用的终止错误
    pub async fn rejected(&self, attempt: &Attempt, err: &GatewayError) {
        self.write(attempt.log(status_for(err), None, Some(err.to_string()), false))
            .await;
    }

    /// 客户端放弃：只记日志，不写缓存、不扣额度、不记成功
    pub async fn disconnected(&self, attempt: &Attempt) {
        tracing::info!(
            credential_id = ?attempt.credential_id,
            "Client disconnected before the response completed"
        );
        self.write(attempt.log(
            CLIENT_CLOSED_REQUEST,
            None,
            Some("client closed request".to_string()),
            false,
        ))
        .await;
    }

    pub async fn cache_hit(&self, attempt: &Attempt, usage: Usage) {
        self.write(attempt.log(200, Some(usage), None, true)).await;
    }

    /// 扣减失败只记录，不影响已成功的响应
    async fn deduct(&self, attempt: &Attempt, usage: Usage) {
        if !self.quota_enabled {
            return;
        }
        let Some(user) = attempt.user.as_deref() else {
            return;
        };
        match self.quota.quota_deduct(user, usage.total_tokens as i64).await {
            Ok(true) => {}
            Ok(false) => tracing::error!(
                tokens = usage.total_tokens,
                "Request succeeded but quota was insufficient for deduction"
            ),
            Err(e) => tracing::error!("Request succeeded but quota deduction failed: {}", e),
        }
    }

    async fn write(&self, log: RequestLog) {
        if let Err(e) = self.logs.log_attempt(&log).await {
            tracing::error!("Failed to log request: {}", e);
        }
    }
}

/// 非流式请求的 handler future 被丢弃时补记 499
pub struct DisconnectGuard {
    armed: Option<(Recorder, Attempt)>,
}

impl DisconnectGuard {
    pub fn arm(recorder: &Recorder, attempt: &Attempt) -> Self {
        Self {
            armed: Some((recorder.clone(), attempt.clone())),
        }
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some((recorder, attempt)) = self.armed.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { recorder.disconnected(&attempt).await });
        }
    }
}
