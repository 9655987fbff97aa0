use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ProviderKind;
use crate::error::Result;
use crate::logging::{CacheEntry, LogFilter, PoolCredentialCounts, RequestLog};
use crate::pool::{Credential, HealthStatus, OAuthCredentials, Pool};

// 凭证存储；计数类操作必须在存储层原子完成
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create_credential(&self, credential: &Credential) -> Result<i64>;
    /// 整条记录覆盖写，后写者胜
    async fn update_credential(&self, credential: &Credential) -> Result<()>;
    async fn get_credential(&self, id: i64) -> Result<Option<Credential>>;
    async fn list_credentials(&self, pool_id: Option<i64>) -> Result<Vec<Credential>>;
    async fn find_active_by_pool(&self, pool_id: i64) -> Result<Vec<Credential>>;
    async fn find_active_by_provider(&self, provider: ProviderKind) -> Result<Vec<Credential>>;
    /// OAuth、启用、带 refresh token 且在 `before` 之前过期
    async fn find_expiring_soon(
        &self,
        provider: Option<ProviderKind>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Credential>>;
    /// 尝试开始时调用：总请求数 +1，推进一分钟限流窗口
    async fn increment_usage(&self, id: i64, now: DateTime<Utc>) -> Result<()>;
    /// 错误数 +1；错误率超过一半时转为 unhealthy
    async fn increment_errors(&self, id: i64, error: &str) -> Result<()>;
    async fn record_success(&self, id: i64) -> Result<()>;
    async fn set_health(&self, id: i64, status: HealthStatus, error: Option<&str>) -> Result<()>;
    /// 刷新成功：换令牌、更新过期时间、恢复健康
    async fn apply_refresh(
        &self,
        id: i64,
        tokens: &OAuthCredentials,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn set_credential_active(&self, id: i64, active: bool) -> Result<bool>;
    async fn soft_delete_credential(&self, id: i64) -> Result<bool>;
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn create_pool(&self, pool: &Pool) -> Result<i64>;
    async fn update_pool(&self, pool: &Pool) -> Result<()>;
    async fn get_pool(&self, id: i64) -> Result<Option<Pool>>;
    async fn list_pools(&self) -> Result<Vec<Pool>>;
    /// 按 id 升序
    async fn find_active_pools(&self, provider: ProviderKind) -> Result<Vec<Pool>>;
    async fn set_pool_active(&self, id: i64, active: bool) -> Result<bool>;
    async fn delete_pool(&self, id: i64) -> Result<bool>;
    async fn increment_pool_requests(&self, id: i64) -> Result<()>;
    async fn increment_pool_errors(&self, id: i64) -> Result<()>;
    async fn credential_counts(&self, pool_id: i64) -> Result<PoolCredentialCounts>;
}

// 每次上游尝试一条日志
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn log_attempt(&self, log: &RequestLog) -> Result<i64>;
    async fn recent_logs(&self, filter: &LogFilter) -> Result<Vec<RequestLog>>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// 只返回未过期的条目
    async fn cache_get(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>>;
    async fn cache_record_hit(&self, id: i64, tokens_saved: u32) -> Result<()>;
    /// 同模型、未过期、带向量的条目
    async fn cache_semantic_candidates(
        &self,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>>;
    /// 同 key 覆盖写
    async fn cache_put(&self, entry: &CacheEntry) -> Result<i64>;
    async fn cache_purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

// 额度是外部协作方，这里只保留接口
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn quota_remaining(&self, user: &str) -> Result<Option<i64>>;
    /// 余额充足才扣减，返回是否扣成功
    async fn quota_deduct(&self, user: &str, amount: i64) -> Result<bool>;
    /// 返回新的余额
    async fn quota_grant(&self, user: &str, amount: i64) -> Result<i64>;
}
