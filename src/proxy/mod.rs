//! 请求编排：解析 -> 额度 -> 缓存 -> 选池选凭据 -> 上游（带重试）-> 收尾 -> 响应

pub mod record;
pub mod stream;
pub mod usage;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use chrono::Utc;

use crate::cache::{CacheLookup, ResponseCache};
use crate::config::{ProviderKind, RoutingConfig, UpstreamConfig};
use crate::error::{GatewayError, Result};
use crate::http_client::{client_for_url_with_timeout, streaming_client_for_url};
use crate::pool::{Credential, Pool};
use crate::protocol::canonical::{ChatRequest, ChatResponse};
use crate::protocol::{Protocol, ProtocolConverter, converter_for};
use crate::providers::{UpstreamAdapter, adapter_for, upstream_error_message};
use crate::routing::{PoolSelector, SelectorState};
use crate::server::model_parser::ParsedModel;
pub use record::{Attempt, CLIENT_CLOSED_REQUEST, DisconnectGuard, Recorder};
use stream::{StreamRelay, open_stream};
use usage::estimate_total_tokens;

/// 协议入口交给编排器的原始请求
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub protocol: Protocol,
    pub path: String,
    pub body: Bytes,
    /// Gemini 的模型在路径里
    pub model_override: Option<String>,
    pub stream_override: Option<bool>,
    /// 调用方身份（bearer token），用于额度
    pub user: Option<String>,
}

struct ProviderClients {
    base_url: String,
    blocking: reqwest::Client,
    streaming: reqwest::Client,
}

pub struct ProxyService {
    recorder: Recorder,
    cache: Arc<ResponseCache>,
    selector: PoolSelector,
    upstream: UpstreamConfig,
    routing: RoutingConfig,
    clients: HashMap<ProviderKind, ProviderClients>,
}

impl ProxyService {
    pub fn new(
        recorder: Recorder,
        cache: Arc<ResponseCache>,
        selector_state: Arc<SelectorState>,
        upstream: UpstreamConfig,
        routing: RoutingConfig,
    ) -> Result<Self> {
        let mut clients = HashMap::new();
        for kind in ProviderKind::ALL {
            let base_url = upstream.base_url(kind);
            clients.insert(
                kind,
                ProviderClients {
                    blocking: client_for_url_with_timeout(&base_url, upstream.timeout())?,
                    streaming: streaming_client_for_url(&base_url)?,
                    base_url,
                },
            );
        }
        Ok(Self {
            recorder,
            cache,
            selector: PoolSelector::with_state(selector_state),
            upstream,
            routing,
            clients,
        })
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub async fn handle(&self, inbound: InboundRequest) -> Result<Response> {
        let converter = converter_for(inbound.protocol);
        let mut req = converter.parse_request(&inbound.body, inbound.model_override.as_deref())?;
        if let Some(stream) = inbound.stream_override {
            req.stream = stream;
        }
        let parsed = ParsedModel::parse(&req.model);
        let provider = parsed.resolve_provider(&self.routing)?;

        let base = Attempt {
            started_at: Utc::now(),
            started: Instant::now(),
            credential_id: None,
            pool_id: None,
            provider: provider.to_string(),
            model: req.model.clone(),
            path: inbound.path,
            protocol: inbound.protocol.as_str().to_string(),
            stream: req.stream,
            user: inbound.user,
        };

        self.check_quota(&base, &req).await?;

        // 流式请求不读也不写缓存
        let mut cache_slot = None;
        if !req.stream {
            match self.cache.lookup(&req).await {
                CacheLookup::Hit { response, kind } => {
                    tracing::info!(model = %req.model, ?kind, "Cache hit");
                    self.recorder.cache_hit(&base, response.usage).await;
                    return json_response(converter, &response);
                }
                CacheLookup::Miss { key, embedding } => cache_slot = Some((key, embedding)),
                CacheLookup::Disabled => {}
            }
        }

        let pool = match self.resolve_pool(provider).await {
            Ok(p) => p,
            Err(e) => {
                self.recorder.rejected(&base, &e).await;
                return Err(e);
            }
        };

        let mut upstream_req = req.clone();
        upstream_req.model = parsed.get_upstream_model_name().to_string();
        let adapter = adapter_for(provider);
        let max_attempts = pool.max_retries as usize + 1;
        let mut tried = HashSet::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt_no in 1..=max_attempts {
            let credentials = self.recorder.credentials.find_active_by_pool(pool.id).await?;
            let credential = match self.selector.select(&pool, &credentials, &tried, Utc::now()) {
                Ok(c) => c.clone(),
                Err(e) => {
                    // 之前的失败已记过日志，直接返回最后一个上游错误
                    if let Some(prev) = last_error {
                        return Err(prev);
                    }
                    let err = GatewayError::from(e);
                    let mut rejected = base.clone();
                    rejected.pool_id = Some(pool.id);
                    self.recorder.rejected(&rejected, &err).await;
                    return Err(err);
                }
            };
            tried.insert(credential.id);
            let attempt = base.for_credential(pool.id, credential.id);
            let guard = self.selector.state().begin(credential.id);
            self.recorder.begin(&attempt).await;
            tracing::debug!(
                pool_id = pool.id,
                credential_id = credential.id,
                attempt = attempt_no,
                model = %upstream_req.model,
                "Dispatching upstream request"
            );

            let err = if req.stream {
                match self.open_upstream_stream(adapter, provider, &credential, &upstream_req).await {
                    Ok(opened) => {
                        let relay = StreamRelay {
                            recorder: self.recorder.clone(),
                            attempt,
                            adapter,
                            converter,
                            request: req,
                            idle_timeout: self.upstream.stream_idle_timeout(),
                            guard,
                        };
                        return Ok(relay.into_response(opened));
                    }
                    Err(e) => e,
                }
            } else {
                let mut disconnect = DisconnectGuard::arm(&self.recorder, &attempt);
                let result = self.call_upstream(adapter, provider, &credential, &upstream_req).await;
                disconnect.disarm();
                drop(guard);
                match result {
                    Ok(mut response) => {
                        response.model = req.model.clone();
                        if let Some((key, embedding)) = cache_slot.take() {
                            self.cache.store(&req, key, embedding, &response).await;
                        }
                        self.recorder.success(&attempt, response.usage).await;
                        return json_response(converter, &response);
                    }
                    Err(e) => e,
                }
            };

            self.recorder.failure(&attempt, &err).await;
            if !err.is_retryable() || attempt_no == max_attempts {
                return Err(err);
            }
            last_error = Some(err);
        }

        Err(last_error.unwrap_or(GatewayError::NoEligibleCredential {
            provider: provider.to_string(),
        }))
    }

    /// 额度不足时在上游调用前拒绝
    async fn check_quota(&self, attempt: &Attempt, req: &ChatRequest) -> Result<()> {
        if !self.recorder.quota_enabled {
            return Ok(());
        }
        let estimate = estimate_total_tokens(req);
        let remaining = match attempt.user.as_deref() {
            Some(user) => self.recorder.quota.quota_remaining(user).await?.unwrap_or(0),
            None => 0,
        };
        if remaining >= estimate {
            return Ok(());
        }
        let err = GatewayError::QuotaExceeded(format!(
            "remaining {} tokens, request needs about {}",
            remaining, estimate
        ));
        self.recorder.rejected(attempt, &err).await;
        Err(err)
    }

    /// 该供应商的启用池里优先取第一个健康池，都不健康时取第一个
    async fn resolve_pool(&self, provider: ProviderKind) -> Result<Pool> {
        let pools = self.recorder.pools.find_active_pools(provider).await?;
        pools
            .iter()
            .find(|p| p.is_healthy())
            .or_else(|| pools.first())
            .cloned()
            .ok_or_else(|| GatewayError::NoEligibleCredential {
                provider: provider.to_string(),
            })
    }

    fn clients(&self, provider: ProviderKind) -> Result<&ProviderClients> {
        self.clients
            .get(&provider)
            .ok_or_else(|| GatewayError::Config(format!("no HTTP client for provider {}", provider)))
    }

    async fn call_upstream(
        &self,
        adapter: &'static dyn UpstreamAdapter,
        provider: ProviderKind,
        credential: &Credential,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        let clients = self.clients(provider)?;
        let resp = adapter
            .build_request(&clients.blocking, &clients.base_url, credential.upstream_auth(), req)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(GatewayError::upstream(
                Some(status.as_u16()),
                upstream_error_message(status.as_u16(), &String::from_utf8_lossy(&body)),
            ));
        }
        adapter.parse_response(&body, &req.model)
    }

    async fn open_upstream_stream(
        &self,
        adapter: &'static dyn UpstreamAdapter,
        provider: ProviderKind,
        credential: &Credential,
        req: &ChatRequest,
    ) -> Result<stream::OpenedStream> {
        let clients = self.clients(provider)?;
        let builder =
            adapter.build_request(&clients.streaming, &clients.base_url, credential.upstream_auth(), req);
        open_stream(builder, self.upstream.timeout(), adapter.stream_framing()).await
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(e.to_string())
    } else {
        GatewayError::Http(e)
    }
}

fn json_response(converter: &dyn ProtocolConverter, response: &ChatResponse) -> Result<Response> {
    let body = converter.format_response(response)?;
    let mut resp = Response::new(Body::from(body));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(resp)
}
