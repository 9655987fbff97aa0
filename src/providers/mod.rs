pub mod anthropic;
pub mod eventstream;
pub mod gemini;
pub mod kiro;
pub mod openai;
pub mod streaming;

use reqwest::RequestBuilder;
use serde_json::Value;

use crate::config::ProviderKind;
use crate::error::Result;
use crate::pool::UpstreamAuth;
use crate::protocol::canonical::{ChatRequest, ChatResponse};
pub use streaming::StreamState;

/// 上游流式响应的成帧方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    Sse,
    /// AWS event stream 二进制帧
    AwsEventStream,
}

/// 上游供应商适配：规范请求 -> 原生 HTTP 请求，原生响应/流事件 -> 规范表示
pub trait UpstreamAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// `req.stream` 决定是否请求流式
    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
        req: &ChatRequest,
    ) -> RequestBuilder;

    fn parse_response(&self, body: &[u8], model: &str) -> Result<ChatResponse>;

    /// 一个上游 SSE 事件 -> 零到多行规范 `data:` 行；上游在流内报错时返回 Err
    fn translate_event(&self, event: &str, data: &str, state: &mut StreamState) -> Result<Vec<String>>;

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    /// 上游流正常结束后补发的规范行；上游自己会发结束块的返回空
    fn finish_stream(&self, _state: &mut StreamState, _request: &ChatRequest) -> Vec<String> {
        Vec::new()
    }

    /// 健康探测：带认证的模型列表请求
    fn probe_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
    ) -> RequestBuilder;
}

pub fn adapter_for(kind: ProviderKind) -> &'static dyn UpstreamAdapter {
    match kind {
        ProviderKind::OpenAI => &openai::OpenAIAdapter,
        ProviderKind::Anthropic => &anthropic::AnthropicAdapter,
        ProviderKind::Gemini => &gemini::GeminiAdapter,
        ProviderKind::Kiro => &kiro::KiroAdapter,
    }
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// 从上游错误体里挑出可读信息
pub fn upstream_error_message(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.chars().take(300).collect());
    format!("upstream returned {}: {}", status, detail.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapters_resolve_by_kind() {
        for kind in ProviderKind::ALL {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn error_message_prefers_structured_fields() {
        assert_eq!(
            upstream_error_message(429, r#"{"error":{"message":"Rate limit reached","type":"x"}}"#),
            "upstream returned 429: Rate limit reached"
        );
        assert_eq!(
            upstream_error_message(500, "plain failure"),
            "upstream returned 500: plain failure"
        );
        assert_eq!(endpoint("http://h/", "/v1/models"), "http://h/v1/models");
    }
}
