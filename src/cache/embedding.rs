use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::http_client::client_for_url_with_timeout;

/// 文本向量化服务；对网关来说是不透明的相似度来源
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Vec<f64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpEmbedder {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = client_for_url_with_timeout(&base_url, timeout)?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let resp = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { text })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Cache(format!(
                "embedding service returned status {}: {}",
                status.as_u16(),
                body
            )));
        }
        let parsed: EmbedResponse = resp.json().await?;
        if let Some(err) = parsed.error.filter(|e| !e.is_empty()) {
            return Err(GatewayError::Cache(format!("embedding error: {}", err)));
        }
        if parsed.embedding.is_empty() {
            return Err(GatewayError::Cache("embedding service returned an empty vector".into()));
        }
        Ok(parsed.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::{Value, json};

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn posts_text_and_reads_vector() {
        let url = spawn(Router::new().route(
            "/embed",
            post(|Json(body): Json<Value>| async move {
                let len = body["text"].as_str().unwrap_or_default().len() as f64;
                Json(json!({ "embedding": [len, 1.0], "dimension": 2 }))
            }),
        ))
        .await;
        let embedder = HttpEmbedder::new(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(embedder.embed("abc").await.unwrap(), vec![3.0, 1.0]);
    }

    #[tokio::test]
    async fn service_errors_surface_as_cache_errors() {
        let url = spawn(Router::new().route(
            "/embed",
            post(|| async { Json(json!({ "embedding": [], "error": "model not loaded" })) }),
        ))
        .await;
        let embedder = HttpEmbedder::new(&url, Duration::from_secs(5)).unwrap();
        let err = embedder.embed("x").await.unwrap_err();
        assert!(matches!(err, GatewayError::Cache(ref m) if m.contains("model not loaded")));
    }
}
