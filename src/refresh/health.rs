use std::time::Duration;

use async_trait::async_trait;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use crate::http_client::client_for_url_with_timeout;
use crate::pool::Credential;
use crate::providers::{adapter_for, upstream_error_message};

/// 主动健康探测：成功返回 Ok，失败给出原因
#[async_trait]
pub trait CredentialProbe: Send + Sync {
    async fn probe(&self, credential: &Credential, timeout: Duration) -> Result<()>;
}

/// 用凭据请求一次供应商的模型列表
pub struct HttpProbe {
    upstream: UpstreamConfig,
}

impl HttpProbe {
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl CredentialProbe for HttpProbe {
    async fn probe(&self, credential: &Credential, timeout: Duration) -> Result<()> {
        let base_url = self.upstream.base_url(credential.provider);
        let client = client_for_url_with_timeout(&base_url, timeout)?;
        let adapter = adapter_for(credential.provider);
        let resp = adapter
            .probe_request(&client, &base_url, credential.upstream_auth())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(format!("probe exceeded {}s", timeout.as_secs()))
                } else {
                    GatewayError::Http(e)
                }
            })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GatewayError::upstream(
            Some(status.as_u16()),
            upstream_error_message(status.as_u16(), &body),
        ))
    }
}
