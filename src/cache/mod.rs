//! 响应缓存：精确指纹命中优先，其次按最后一条 user 消息的向量做语义匹配

pub mod embedding;
pub mod vector;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::logging::CacheEntry;
use crate::protocol::canonical::{ChatRequest, ChatResponse};
use crate::server::storage_traits::CacheStore;
pub use embedding::{Embedder, HttpEmbedder};
pub use vector::cosine_similarity;

/// 精确缓存键：规范请求中影响输出的字段做 SHA-256
pub fn fingerprint(req: &ChatRequest) -> String {
    let normalized = json!({
        "model": req.model,
        "messages": req.messages,
        "temperature": req.temperature,
        "top_p": req.top_p,
        "max_tokens": req.max_tokens,
        "tools": req.tools,
    });
    hex::encode(Sha256::digest(normalized.to_string().as_bytes()))
}

/// 阈值包含边界
pub fn meets_threshold(similarity: f64, threshold: f64) -> bool {
    similarity >= threshold
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HitKind {
    Exact,
    Semantic(f64),
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit {
        response: ChatResponse,
        kind: HitKind,
    },
    /// 未命中时带回已算好的 key 和向量，写缓存时复用
    Miss {
        key: String,
        embedding: Option<Vec<f64>>,
    },
    Disabled,
}

pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    embedder: Option<Arc<dyn Embedder>>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        embedder: Option<Arc<dyn Embedder>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// 缓存故障一律按未命中处理
    pub async fn lookup(&self, req: &ChatRequest) -> CacheLookup {
        if !self.config.enabled {
            return CacheLookup::Disabled;
        }
        let key = fingerprint(req);
        let now = Utc::now();

        match self.store.cache_get(&key, now).await {
            Ok(Some(entry)) => return self.hit(entry, HitKind::Exact).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("Cache lookup failed, treating as miss: {}", e),
        }

        let embedding = self.embed_query(req).await;
        if let Some(query) = embedding.as_deref()
            && let Some((entry, similarity)) = self.best_semantic_match(&req.model, query, now).await
        {
            return self.hit(entry, HitKind::Semantic(similarity)).await;
        }
        CacheLookup::Miss { key, embedding }
    }

    /// 只在上游成功后调用；同 key 覆盖
    pub async fn store(
        &self,
        req: &ChatRequest,
        key: String,
        embedding: Option<Vec<f64>>,
        response: &ChatResponse,
    ) {
        if !self.config.enabled {
            return;
        }
        let now = Utc::now();
        let mut response = response.clone();
        response.cached = false;
        let entry = CacheEntry {
            id: 0,
            cache_key: key,
            model: req.model.clone(),
            query_text: req.last_user_text().unwrap_or_default().to_string(),
            embedding,
            request: req.clone(),
            response,
            tokens_saved: 0,
            hit_count: 0,
            expires_at: now + chrono::Duration::seconds(self.config.ttl_secs as i64),
            created_at: now,
        };
        match self.store.cache_put(&entry).await {
            Ok(id) => tracing::debug!(cache_id = id, model = %entry.model, "Cached response"),
            Err(e) => tracing::warn!("Failed to write cache entry: {}", e),
        }
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.cache_purge_expired(now).await
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match cache.purge_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(purged = n, "Cache sweep finished"),
                    Err(e) => tracing::error!("Cache sweep failed: {}", e),
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    async fn hit(&self, entry: CacheEntry, kind: HitKind) -> CacheLookup {
        let mut response = entry.response;
        if let Err(e) = self
            .store
            .cache_record_hit(entry.id, response.usage.total_tokens)
            .await
        {
            tracing::warn!(cache_id = entry.id, "Failed to record cache hit: {}", e);
        }
        response.cached = true;
        CacheLookup::Hit { response, kind }
    }

    async fn embed_query(&self, req: &ChatRequest) -> Option<Vec<f64>> {
        if !self.config.semantic_match {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        let text = req.last_user_text()?;
        match embedder.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                // 向量服务不可用时退化为仅精确匹配
                tracing::warn!("Embedding failed, semantic cache skipped: {}", e);
                None
            }
        }
    }

    async fn best_semantic_match(
        &self,
        model: &str,
        query: &[f64],
        now: DateTime<Utc>,
    ) -> Option<(CacheEntry, f64)> {
        let candidates = match self.store.cache_semantic_candidates(model, now).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Semantic candidate query failed: {}", e);
                return None;
            }
        };
        let mut best: Option<(CacheEntry, f64)> = None;
        for entry in candidates {
            let Some(stored) = entry.embedding.as_deref() else {
                continue;
            };
            let similarity = match cosine_similarity(query, stored) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(cache_id = entry.id, "Skipping cache entry: {}", e);
                    continue;
                }
            };
            if best.as_ref().is_none_or(|(_, s)| similarity > *s) {
                best = Some((entry, similarity));
            }
        }
        best.filter(|(_, s)| meets_threshold(*s, self.config.threshold))
    }
}
