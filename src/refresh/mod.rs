//! 后台凭据维护：OAuth 令牌临期刷新 + 按池间隔的主动健康探测

pub mod health;
pub mod oauth;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RefreshConfig;
use crate::error::{GatewayError, Result};
use crate::pool::{AuthType, Credential, HealthStatus, Pool};
use crate::server::storage_traits::{CredentialStore, PoolStore};
pub use health::{CredentialProbe, HttpProbe};
pub use oauth::{OidcTokenRefresher, RefreshedTokens, TokenRefresher};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub refreshed: usize,
    pub refresh_failed: usize,
    pub probed: usize,
    pub probe_failed: usize,
}

pub struct RefreshEngine {
    credentials: Arc<dyn CredentialStore>,
    pools: Arc<dyn PoolStore>,
    refresher: Arc<dyn TokenRefresher>,
    probe: Arc<dyn CredentialProbe>,
    config: RefreshConfig,
    /// 池 id -> 上次探测时间
    last_probe: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl RefreshEngine {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        pools: Arc<dyn PoolStore>,
        refresher: Arc<dyn TokenRefresher>,
        probe: Arc<dyn CredentialProbe>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            credentials,
            pools,
            refresher,
            probe,
            config,
            last_probe: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            tracing::info!("Credential refresh engine started (interval {:?})", period);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let report = engine.run_cycle(Utc::now()).await;
                if report != CycleReport::default() {
                    tracing::info!(
                        refreshed = report.refreshed,
                        refresh_failed = report.refresh_failed,
                        probed = report.probed,
                        probe_failed = report.probe_failed,
                        "Credential maintenance cycle finished"
                    );
                }
            }
            tracing::info!("Credential refresh engine stopped");
        })
    }

    /// 先刷新临期令牌，再做到期的健康探测
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        match self.refresh_expiring(now).await {
            Ok((ok, failed)) => {
                report.refreshed = ok;
                report.refresh_failed = failed;
            }
            Err(e) => tracing::error!("Failed to find expiring credentials: {}", e),
        }
        if self.config.health_probe {
            match self.probe_due_pools(now).await {
                Ok((probed, failed)) => {
                    report.probed = probed;
                    report.probe_failed = failed;
                }
                Err(e) => tracing::error!("Health probe pass failed: {}", e),
            }
        }
        report
    }

    /// 返回 (成功数, 失败数)；单个凭据失败不影响其它
    pub async fn refresh_expiring(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let horizon = chrono::Duration::seconds(self.config.lookahead_secs);
        let due: Vec<Credential> = self
            .credentials
            .find_expiring_soon(None, now + horizon)
            .await?
            .into_iter()
            .filter(|c| c.needs_refresh(now, horizon))
            .collect();
        if due.is_empty() {
            return Ok((0, 0));
        }
        tracing::info!("Found {} expiring credentials", due.len());

        let results: Vec<bool> = stream::iter(due)
            .map(|c| async move { self.refresh_credential(&c).await.is_ok() })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let ok = results.iter().filter(|r| **r).count();
        Ok((ok, results.len() - ok))
    }

    /// 刷新单个 OAuth 凭据；失败时标记 unhealthy 但不停用
    pub async fn refresh_credential(&self, credential: &Credential) -> Result<()> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs.max(1));
        let outcome = match tokio::time::timeout(timeout, self.refresher.refresh(credential)).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Timeout(format!(
                "token refresh exceeded {}s",
                timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(refreshed) => {
                self.credentials
                    .apply_refresh(credential.id, &refreshed.tokens, refreshed.expires_at)
                    .await?;
                tracing::info!(credential_id = credential.id, "Token refreshed successfully");
                Ok(())
            }
            Err(e) => {
                let message = format!("auto refresh failed: {}", e);
                tracing::warn!(
                    credential_id = credential.id,
                    account = %credential.display_name(),
                    "{}",
                    message
                );
                self.credentials
                    .set_health(credential.id, HealthStatus::Unhealthy, Some(&message))
                    .await?;
                Err(match e {
                    GatewayError::Refresh(_) => e,
                    other => GatewayError::Refresh(other.to_string()),
                })
            }
        }
    }

    /// 探测单个凭据并写回健康状态
    pub async fn probe_credential(&self, credential: &Credential, timeout: Duration) -> Result<()> {
        let outcome = match tokio::time::timeout(timeout, self.probe.probe(credential, timeout)).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Timeout(format!(
                "probe exceeded {}s",
                timeout.as_secs()
            ))),
        };
        match outcome {
            Ok(()) => {
                self.credentials
                    .set_health(credential.id, HealthStatus::Healthy, None)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let message = format!("health check failed: {}", e);
                tracing::warn!(credential_id = credential.id, "{}", message);
                self.credentials
                    .set_health(credential.id, HealthStatus::Unhealthy, Some(&message))
                    .await?;
                Err(e)
            }
        }
    }

    /// 管理端强制刷新：OAuth 走刷新流程，API key 走健康探测
    pub async fn force_refresh(&self, credential: &Credential, pool: Option<&Pool>) -> Result<()> {
        match credential.auth_type() {
            AuthType::OAuth => self.refresh_credential(credential).await,
            AuthType::ApiKey => {
                let secs = pool.map(|p| p.health_check_timeout_secs).unwrap_or(10);
                self.probe_credential(credential, Duration::from_secs(secs.max(1)))
                    .await
            }
        }
    }

    /// 每个池最多每 `health_check_interval` 探测一次；返回 (探测数, 失败数)
    pub async fn probe_due_pools(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let pools = self.pools.list_pools().await?;
        let due: Vec<Pool> = {
            let mut last = self.last_probe.lock().await;
            pools
                .into_iter()
                .filter(|p| p.is_active)
                .filter(|p| {
                    let interval = chrono::Duration::seconds(p.health_check_interval_secs as i64);
                    let is_due = last.get(&p.id).is_none_or(|at| now - *at >= interval);
                    if is_due {
                        last.insert(p.id, now);
                    }
                    is_due
                })
                .collect()
        };

        let (mut probed, mut failed) = (0, 0);
        for pool in due {
            let creds = self.credentials.find_active_by_pool(pool.id).await?;
            let timeout = Duration::from_secs(pool.health_check_timeout_secs.max(1));
            let results: Vec<bool> = stream::iter(creds)
                .map(|c| async move { self.probe_credential(&c, timeout).await.is_ok() })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
            probed += results.len();
            failed += results.iter().filter(|ok| !**ok).count();
        }
        Ok((probed, failed))
    }
}
