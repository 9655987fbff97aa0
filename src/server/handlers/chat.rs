use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::protocol::{GeminiAction, Protocol};
use crate::proxy::InboundRequest;
use crate::server::AppState;
use crate::server::util::client_token;

#[derive(Debug, Default, Deserialize)]
pub struct GeminiQuery {
    pub key: Option<String>,
}

pub async fn chat_completions(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    app_state
        .proxy
        .handle(InboundRequest {
            protocol: Protocol::OpenAI,
            path: "/v1/chat/completions".to_string(),
            body,
            model_override: None,
            stream_override: None,
            user: client_token(&headers),
        })
        .await
}

pub async fn messages(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    app_state
        .proxy
        .handle(InboundRequest {
            protocol: Protocol::Anthropic,
            path: "/v1/messages".to_string(),
            body,
            model_override: None,
            stream_override: None,
            user: client_token(&headers),
        })
        .await
}

/// `{model}:generateContent` / `{model}:streamGenerateContent`
pub async fn generate_content(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(action): Path<String>,
    Query(query): Query<GeminiQuery>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let parsed = GeminiAction::parse(&action)?;
    let stream = parsed.is_stream();
    app_state
        .proxy
        .handle(InboundRequest {
            protocol: Protocol::Gemini,
            path: format!("/v1/models/{}", action),
            body,
            model_override: Some(parsed.model),
            stream_override: Some(stream),
            user: client_token(&headers).or(query.key),
        })
        .await
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
