use serde_json::{Value, json};

use super::canonical::{ChatRequest, ChatResponse, DONE_MARKER, sse_data};
use super::{
    Protocol, ProtocolConverter, StreamFrames, apply_model_override, ensure_messages, sse_frame,
};
use crate::error::{GatewayError, Result};

/// 规范表示本身就是 OpenAI 形状，基本是透传
pub struct OpenAIConverter;

impl ProtocolConverter for OpenAIConverter {
    fn protocol(&self) -> Protocol {
        Protocol::OpenAI
    }

    fn parse_request(&self, raw: &[u8], model_override: Option<&str>) -> Result<ChatRequest> {
        let mut req: ChatRequest = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("invalid OpenAI request: {}", e)))?;
        apply_model_override(&mut req, model_override);
        ensure_messages(&req)?;
        Ok(req)
    }

    fn format_response(&self, response: &ChatResponse) -> Result<Vec<u8>> {
        serde_json::to_vec(response).map_err(|e| GatewayError::Format(e.to_string()))
    }

    fn format_stream_chunk(&self, line: &str, _frames: &mut StreamFrames) -> Option<String> {
        let data = sse_data(line)?;
        if data == DONE_MARKER {
            return Some(sse_frame(None, DONE_MARKER));
        }
        // 半截或损坏的 JSON 直接丢弃
        serde_json::from_str::<Value>(data).ok()?;
        Some(sse_frame(None, data))
    }

    fn format_stream_error(&self, message: &str) -> String {
        let body = json!({
            "error": { "message": message, "type": "upstream_error", "code": "upstream_error" }
        });
        sse_frame(None, &body.to_string())
    }
}
