pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{GatewayError, Result};
use canonical::{ChatRequest, ChatResponse};

/// 入站线协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    OpenAI,
    Anthropic,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

/// 单个协议与规范表示之间的双向转换
pub trait ProtocolConverter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// 线格式 -> 规范请求；`model_override` 非空时覆盖请求体里的模型
    fn parse_request(&self, raw: &[u8], model_override: Option<&str>) -> Result<ChatRequest>;

    fn format_response(&self, response: &ChatResponse) -> Result<Vec<u8>>;

    /// 输入为规范流的一行（`data: {...}` 或 `data: [DONE]`），输出为已成帧的字节；
    /// 无法解析或无需输出时返回 None，流继续。`frames` 在同一条流的所有调用间共享
    fn format_stream_chunk(&self, line: &str, frames: &mut StreamFrames) -> Option<String>;

    /// 第一个分块之前需要先发的帧
    fn stream_preamble(&self, _id: &str, _model: &str, _frames: &mut StreamFrames) -> Option<String> {
        None
    }

    /// 流已开始后发生错误时的带内错误帧
    fn format_stream_error(&self, message: &str) -> String;

    fn stream_content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

/// 一条出站流的成帧状态（内容块编号、待发的结束原因与用量）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFrames {
    /// 当前打开的内容块
    pub open_block: Option<BlockKind>,
    pub open_index: usize,
    /// 下一个内容块的编号
    pub next_index: usize,
    /// 上游工具调用序号 -> 内容块编号
    pub tool_blocks: HashMap<u32, usize>,
    pub finish_reason: Option<String>,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
}

pub fn converter_for(protocol: Protocol) -> &'static dyn ProtocolConverter {
    match protocol {
        Protocol::OpenAI => &openai::OpenAIConverter,
        Protocol::Anthropic => &anthropic::AnthropicConverter,
        Protocol::Gemini => &gemini::GeminiConverter,
    }
}

/// Gemini 路径里的 `{model}:{operation}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiAction {
    pub model: String,
    pub operation: String,
}

impl GeminiAction {
    pub fn parse(segment: &str) -> Result<Self> {
        let parts: Vec<&str> = segment.split(':').collect();
        if parts.len() != 2 || parts[0].trim().is_empty() || parts[1].trim().is_empty() {
            return Err(GatewayError::Parse("Invalid Gemini API path format".into()));
        }
        Ok(Self {
            model: parts[0].to_string(),
            operation: parts[1].to_string(),
        })
    }

    pub fn is_stream(&self) -> bool {
        self.operation == "streamGenerateContent"
    }
}

pub(crate) fn ensure_messages(req: &ChatRequest) -> Result<()> {
    if req.messages.is_empty() {
        return Err(GatewayError::Parse("messages must not be empty".into()));
    }
    Ok(())
}

pub(crate) fn apply_model_override(req: &mut ChatRequest, model_override: Option<&str>) {
    if let Some(m) = model_override.filter(|m| !m.trim().is_empty()) {
        req.model = m.to_string();
    }
}

/// SSE 帧：可选 event 行 + data 行 + 空行
pub(crate) fn sse_frame(event: Option<&str>, data: &str) -> String {
    match event {
        Some(ev) => format!("event: {}\ndata: {}\n\n", ev, data),
        None => format!("data: {}\n\n", data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_resolves_each_protocol() {
        for p in [Protocol::OpenAI, Protocol::Anthropic, Protocol::Gemini] {
            assert_eq!(converter_for(p).protocol(), p);
        }
        assert_eq!(converter_for(Protocol::Gemini).stream_content_type(), "application/x-ndjson");
    }

    #[test]
    fn gemini_action_parsing() {
        let a = GeminiAction::parse("gemini-1.5-pro:streamGenerateContent").unwrap();
        assert_eq!(a.model, "gemini-1.5-pro");
        assert!(a.is_stream());

        let b = GeminiAction::parse("gemini-1.5-pro:generateContent").unwrap();
        assert!(!b.is_stream());
        let c = GeminiAction::parse("gemini-1.5-pro:countTokens").unwrap();
        assert!(!c.is_stream());

        for bad in ["gemini-1.5-pro", "a:b:c", ":generateContent", "model:"] {
            let err = GeminiAction::parse(bad).unwrap_err();
            assert!(matches!(err, GatewayError::Parse(_)), "{bad}");
            assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        }
    }
}
