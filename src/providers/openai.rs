use reqwest::RequestBuilder;
use serde_json::Value;

use super::{StreamState, UpstreamAdapter, endpoint};
use crate::config::ProviderKind;
use crate::error::{GatewayError, Result};
use crate::pool::UpstreamAuth;
use crate::protocol::canonical::{ChatChunk, ChatRequest, ChatResponse, DONE_MARKER, StreamOptions};

fn bearer(auth: UpstreamAuth<'_>) -> &str {
    match auth {
        UpstreamAuth::ApiKey(k) | UpstreamAuth::Bearer(k) => k,
    }
}

pub struct OpenAIAdapter;

impl UpstreamAdapter for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
        req: &ChatRequest,
    ) -> RequestBuilder {
        let mut body = req.clone();
        if body.stream {
            // 要求上游在最后一块带上 usage
            body.stream_options = Some(StreamOptions { include_usage: true });
        } else {
            body.stream_options = None;
        }
        let builder = client
            .post(endpoint(base_url, "/v1/chat/completions"))
            .bearer_auth(bearer(auth))
            .json(&body);
        if body.stream {
            builder.header("Accept", "text/event-stream")
        } else {
            builder
        }
    }

    fn parse_response(&self, body: &[u8], _model: &str) -> Result<ChatResponse> {
        serde_json::from_slice(body).map_err(|e| {
            GatewayError::upstream(None, format!("invalid OpenAI response: {}", e))
        })
    }

    fn translate_event(&self, _event: &str, data: &str, state: &mut StreamState) -> Result<Vec<String>> {
        let data = data.trim();
        if data == DONE_MARKER {
            return Ok(vec![state.done_line()]);
        }
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Skipping malformed OpenAI chunk: {}", e);
                return Ok(Vec::new());
            }
        };
        // 流已开始后上游只能用 error 事件报错
        if let Some(err) = value.get("error") {
            let msg = err
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| err.as_str())
                .unwrap_or("unknown stream error");
            return Err(GatewayError::upstream(None, msg.to_string()));
        }
        let chunk: ChatChunk = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("Skipping malformed OpenAI chunk: {}", e);
                return Ok(Vec::new());
            }
        };
        if let Some(u) = chunk.usage {
            state.usage = Some(u);
        }
        if let Some(finish) = chunk.choices.iter().find_map(|c| c.finish_reason.clone()) {
            state.finish_reason = Some(finish);
        }
        if !chunk.id.is_empty() {
            state.id = chunk.id.clone();
        }
        Ok(vec![chunk.to_data_line()])
    }

    fn probe_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
    ) -> RequestBuilder {
        client
            .get(endpoint(base_url, "/v1/models"))
            .bearer_auth(bearer(auth))
    }
}
