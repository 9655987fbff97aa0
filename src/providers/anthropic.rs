use reqwest::RequestBuilder;
use serde_json::Value;

use super::{StreamState, UpstreamAdapter, endpoint};
use crate::config::ProviderKind;
use crate::error::{GatewayError, Result};
use crate::pool::UpstreamAuth;
use crate::protocol::anthropic::{
    ANTHROPIC_VERSION, MessagesResponse, finish_from_stop_reason, from_canonical_request,
    to_canonical_response,
};
use crate::protocol::canonical::{ChatRequest, ChatResponse};

fn with_auth(builder: RequestBuilder, auth: UpstreamAuth<'_>) -> RequestBuilder {
    let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
    match auth {
        UpstreamAuth::ApiKey(k) => builder.header("x-api-key", k),
        UpstreamAuth::Bearer(t) => builder.bearer_auth(t),
    }
}

pub struct AnthropicAdapter;

impl UpstreamAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
        req: &ChatRequest,
    ) -> RequestBuilder {
        let body = from_canonical_request(req, &req.model);
        with_auth(client.post(endpoint(base_url, "/v1/messages")), auth).json(&body)
    }

    fn parse_response(&self, body: &[u8], _model: &str) -> Result<ChatResponse> {
        let resp: MessagesResponse = serde_json::from_slice(body).map_err(|e| {
            GatewayError::upstream(None, format!("invalid Anthropic response: {}", e))
        })?;
        Ok(to_canonical_response(resp))
    }

    fn translate_event(&self, event: &str, data: &str, state: &mut StreamState) -> Result<Vec<String>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Skipping malformed Anthropic event: {}", e);
                return Ok(Vec::new());
            }
        };
        let kind = v.get("type").and_then(Value::as_str).unwrap_or(event);
        let mut out = Vec::new();
        match kind {
            "message_start" => {
                if let Some(msg) = v.get("message") {
                    if let Some(id) = msg.get("id").and_then(Value::as_str) {
                        state.id = id.to_string();
                    }
                    if let Some(model) = msg.get("model").and_then(Value::as_str) {
                        state.model = model.to_string();
                    }
                    if let Some(n) = msg.pointer("/usage/input_tokens").and_then(Value::as_u64) {
                        state.set_prompt_tokens(n as u32);
                    }
                }
                out.push(state.role_line());
            }
            "content_block_start" => {
                let index = v.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let block = v.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) == Some("tool_use") {
                    let id = block.and_then(|b| b.get("id")).and_then(Value::as_str).unwrap_or_default();
                    let name = block.and_then(|b| b.get("name")).and_then(Value::as_str).unwrap_or_default();
                    out.push(state.tool_start_line(index, id, name));
                }
            }
            "content_block_delta" => {
                let index = v.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let delta = v.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                            out.push(state.text_line(text));
                        }
                    }
                    Some("input_json_delta") => {
                        let partial = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        out.extend(state.tool_args_line(index, partial));
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(n) = v.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    state.set_completion_tokens(n as u32);
                }
                let stop = v.pointer("/delta/stop_reason").and_then(Value::as_str);
                if let Some(finish) = finish_from_stop_reason(stop) {
                    out.push(state.finish_line(&finish));
                }
            }
            "message_stop" => out.push(state.done_line()),
            "error" => {
                let msg = v
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                return Err(GatewayError::upstream(None, msg.to_string()));
            }
            // ping、content_block_stop 等无需输出
            _ => {}
        }
        Ok(out)
    }

    fn probe_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
    ) -> RequestBuilder {
        with_auth(client.get(endpoint(base_url, "/v1/models")), auth)
    }
}
