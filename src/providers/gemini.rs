use reqwest::RequestBuilder;

use super::{StreamState, UpstreamAdapter, endpoint};
use crate::config::ProviderKind;
use crate::error::{GatewayError, Result};
use crate::pool::UpstreamAuth;
use crate::protocol::canonical::{ChatRequest, ChatResponse};
use crate::protocol::gemini::{
    GenerateContentResponse, finish_reason_from_gemini, from_canonical_request,
    to_canonical_response,
};

fn with_auth(builder: RequestBuilder, auth: UpstreamAuth<'_>) -> RequestBuilder {
    match auth {
        UpstreamAuth::ApiKey(k) => builder.query(&[("key", k)]),
        UpstreamAuth::Bearer(t) => builder.bearer_auth(t),
    }
}

pub struct GeminiAdapter;

impl UpstreamAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
        req: &ChatRequest,
    ) -> RequestBuilder {
        let path = if req.stream {
            format!("/v1beta/models/{}:streamGenerateContent", req.model)
        } else {
            format!("/v1beta/models/{}:generateContent", req.model)
        };
        let mut builder = client.post(endpoint(base_url, &path));
        if req.stream {
            builder = builder.query(&[("alt", "sse")]);
        }
        with_auth(builder, auth).json(&from_canonical_request(req))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<ChatResponse> {
        let resp: GenerateContentResponse = serde_json::from_slice(body).map_err(|e| {
            GatewayError::upstream(None, format!("invalid Gemini response: {}", e))
        })?;
        Ok(to_canonical_response(resp, model))
    }

    fn translate_event(&self, _event: &str, data: &str, state: &mut StreamState) -> Result<Vec<String>> {
        let resp: GenerateContentResponse = match serde_json::from_str(data) {
            Ok(r) => r,
            Err(e) => {
                // 流内错误对象 {"error": {...}}
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(data)
                    && let Some(msg) = v.pointer("/error/message").and_then(|m| m.as_str())
                {
                    return Err(GatewayError::upstream(None, msg.to_string()));
                }
                tracing::debug!("Skipping malformed Gemini chunk: {}", e);
                return Ok(Vec::new());
            }
        };
        if let Some(u) = resp.usage_metadata {
            state.set_prompt_tokens(u.prompt_token_count);
            state.set_completion_tokens(u.candidates_token_count);
        }

        let mut out = Vec::new();
        let Some(candidate) = resp.candidates.into_iter().next() else {
            return Ok(out);
        };
        for part in &candidate.content.parts {
            if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
                out.push(state.text_line(text));
            }
            if let Some(call) = &part.function_call {
                let id = format!("call_{}", call.name);
                out.push(state.whole_tool_line(&id, &call.name, &call.args.to_string()));
            }
        }
        let has_tools = state.has_tool_calls();
        if let Some(finish) = finish_reason_from_gemini(candidate.finish_reason.as_deref(), has_tools) {
            out.push(state.finish_line(&finish));
        }
        Ok(out)
    }

    fn probe_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
    ) -> RequestBuilder {
        with_auth(client.get(endpoint(base_url, "/v1beta/models")), auth)
    }
}
