use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::canonical::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, DONE_MARKER, FunctionCall,
    FunctionDefinition, Tool, ToolCall, Usage, flatten_text, sse_data,
};
use super::{
    BlockKind, Protocol, ProtocolConverter, StreamFrames, apply_model_override, ensure_messages,
    sse_frame,
};
use crate::error::{GatewayError, Result};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub max_tokens: u32,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    /// 字符串或内容块数组
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "message_kind")]
    pub kind: String,
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

fn message_kind() -> String {
    "message".to_string()
}

fn assistant_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

pub fn stop_reason_from_finish(finish: Option<&str>) -> &'static str {
    match finish {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

pub fn finish_from_stop_reason(stop: Option<&str>) -> Option<String> {
    stop.map(|s| {
        match s {
            "max_tokens" => "length",
            "tool_use" => "tool_calls",
            _ => "stop",
        }
        .to_string()
    })
}

fn blocks_of(content: &Value) -> Result<Vec<ContentBlock>> {
    match content {
        Value::String(s) => Ok(vec![ContentBlock::Text { text: s.clone() }]),
        Value::Array(_) => serde_json::from_value(content.clone())
            .map_err(|e| GatewayError::Parse(format!("invalid content block: {}", e))),
        Value::Null => Ok(Vec::new()),
        other => Err(GatewayError::Parse(format!("unsupported content: {}", other))),
    }
}

/// Anthropic Messages 请求 -> 规范请求
pub fn to_canonical_request(req: MessagesRequest) -> Result<ChatRequest> {
    let mut messages = Vec::new();
    if let Some(system) = req.system.as_ref().and_then(flatten_text) {
        messages.push(ChatMessage::text("system", system));
    }

    for msg in &req.messages {
        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks_of(&msg.content)? {
            match block {
                ContentBlock::Text { text } => texts.push(text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name,
                        arguments: input.to_string(),
                    },
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(flatten_text(&content).unwrap_or_default()),
                    tool_call_id: Some(tool_use_id),
                    ..Default::default()
                }),
                ContentBlock::Unsupported => {}
            }
        }
        if texts.is_empty() && tool_calls.is_empty() {
            continue;
        }
        messages.push(ChatMessage {
            role: msg.role.clone(),
            content: if texts.is_empty() { None } else { Some(texts.join("\n")) },
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            ..Default::default()
        });
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| Tool {
                kind: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name,
                    description: t.description,
                    parameters: Some(t.input_schema),
                },
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().and_then(|tc| {
        match tc.get("type").and_then(Value::as_str) {
            Some("auto") => Some(json!("auto")),
            Some("any") => Some(json!("required")),
            Some("none") => Some(json!("none")),
            Some("tool") => tc
                .get("name")
                .map(|name| json!({ "type": "function", "function": { "name": name } })),
            _ => None,
        }
    });

    Ok(ChatRequest {
        model: req.model,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_tokens: (req.max_tokens > 0).then_some(req.max_tokens),
        stop: req.stop_sequences,
        tools,
        tool_choice,
        stream: req.stream.unwrap_or(false),
        user: req
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        ..Default::default()
    })
}

/// 规范请求 -> Anthropic Messages 请求（发往上游）
pub fn from_canonical_request(req: &ChatRequest, upstream_model: &str) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut out: Vec<(String, Vec<Value>)> = Vec::new();

    // Anthropic 要求角色交替，同角色相邻消息合并
    fn push(out: &mut Vec<(String, Vec<Value>)>, role: &str, blocks: Vec<Value>) {
        if blocks.is_empty() {
            return;
        }
        match out.last_mut() {
            Some((last_role, last_blocks)) if last_role == role => last_blocks.extend(blocks),
            _ => out.push((role.to_string(), blocks)),
        }
    }

    for m in &req.messages {
        match m.role.as_str() {
            "system" | "developer" => {
                if let Some(c) = &m.content {
                    system_parts.push(c.clone());
                }
            }
            "tool" => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content.clone().unwrap_or_default(),
                });
                push(&mut out, "user", vec![block]);
            }
            role => {
                let role = if role == "assistant" { "assistant" } else { "user" };
                let mut blocks = Vec::new();
                if let Some(text) = m.content.as_ref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for call in m.tool_calls.iter().flatten() {
                    let input: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                push(&mut out, role, blocks);
            }
        }
    }

    let messages = out
        .into_iter()
        .map(|(role, blocks)| {
            // 单个纯文本块退化为字符串
            let content = match blocks.as_slice() {
                [only] if only.get("type").and_then(Value::as_str) == Some("text") => {
                    only.get("text").cloned().unwrap_or(Value::Null)
                }
                _ => Value::Array(blocks),
            };
            AnthropicMessage { role, content }
        })
        .collect();

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t.function.parameters.clone().unwrap_or_else(empty_schema),
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().and_then(|tc| match tc {
        Value::String(s) if s == "auto" => Some(json!({ "type": "auto" })),
        Value::String(s) if s == "required" => Some(json!({ "type": "any" })),
        Value::String(s) if s == "none" => Some(json!({ "type": "none" })),
        Value::Object(_) => tc
            .pointer("/function/name")
            .map(|name| json!({ "type": "tool", "name": name })),
        _ => None,
    });

    MessagesRequest {
        model: upstream_model.to_string(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_parts.is_empty()).then(|| Value::String(system_parts.join("\n"))),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop.clone(),
        stream: req.stream.then_some(true),
        tools,
        tool_choice,
        metadata: req.user.as_ref().map(|u| json!({ "user_id": u })),
    }
}

/// 上游 Anthropic 响应 -> 规范响应
pub fn to_canonical_response(resp: MessagesResponse) -> ChatResponse {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in resp.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }
    ChatResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: resp.model,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(texts.join("")),
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                ..Default::default()
            },
            finish_reason: finish_from_stop_reason(resp.stop_reason.as_deref()),
        }],
        usage: Usage::new(resp.usage.input_tokens, resp.usage.output_tokens),
        cached: false,
    }
}

/// 规范响应 -> Anthropic 响应（返回给客户端）
pub fn from_canonical_response(resp: &ChatResponse) -> MessagesResponse {
    let mut content = Vec::new();
    if let Some(msg) = resp.first_message() {
        if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Text { text: text.clone() });
        }
        for call in msg.tool_calls.iter().flatten() {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({})),
            });
        }
    }
    if content.is_empty() {
        content.push(ContentBlock::Text { text: String::new() });
    }
    let id = if resp.id.starts_with("msg_") {
        resp.id.clone()
    } else {
        format!("msg_{}", resp.id)
    };
    MessagesResponse {
        id,
        kind: message_kind(),
        role: assistant_role(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(stop_reason_from_finish(resp.finish_reason()).to_string()),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: resp.usage.prompt_tokens,
            output_tokens: resp.usage.completion_tokens,
        },
    }
}

/// 关闭当前块（如有）后打开一个新块，返回新块编号
fn open_block(frames: &mut StreamFrames, kind: BlockKind, content_block: Value, out: &mut String) -> usize {
    close_block(frames, out);
    let index = frames.next_index;
    frames.next_index += 1;
    frames.open_block = Some(kind);
    frames.open_index = index;
    let ev = json!({
        "type": "content_block_start",
        "index": index,
        "content_block": content_block
    });
    out.push_str(&sse_frame(Some("content_block_start"), &ev.to_string()));
    index
}

fn close_block(frames: &mut StreamFrames, out: &mut String) {
    if frames.open_block.take().is_some() {
        let ev = json!({ "type": "content_block_stop", "index": frames.open_index });
        out.push_str(&sse_frame(Some("content_block_stop"), &ev.to_string()));
    }
}

pub struct AnthropicConverter;

impl ProtocolConverter for AnthropicConverter {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn parse_request(&self, raw: &[u8], model_override: Option<&str>) -> Result<ChatRequest> {
        let wire: MessagesRequest = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("invalid Anthropic request: {}", e)))?;
        let mut req = to_canonical_request(wire)?;
        apply_model_override(&mut req, model_override);
        ensure_messages(&req)?;
        Ok(req)
    }

    fn format_response(&self, response: &ChatResponse) -> Result<Vec<u8>> {
        serde_json::to_vec(&from_canonical_response(response))
            .map_err(|e| GatewayError::Format(e.to_string()))
    }

    fn stream_preamble(&self, id: &str, model: &str, frames: &mut StreamFrames) -> Option<String> {
        let start = json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", id),
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": 0, "output_tokens": 0 }
            }
        });
        let mut out = sse_frame(Some("message_start"), &start.to_string());
        open_block(frames, BlockKind::Text, json!({ "type": "text", "text": "" }), &mut out);
        Some(out)
    }

    fn format_stream_chunk(&self, line: &str, frames: &mut StreamFrames) -> Option<String> {
        let data = sse_data(line)?;
        if data == DONE_MARKER {
            // 结束原因和用量都到齐后才发 message_delta
            let mut out = String::new();
            close_block(frames, &mut out);
            let delta = json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": stop_reason_from_finish(frames.finish_reason.as_deref()),
                    "stop_sequence": null
                },
                "usage": { "output_tokens": frames.output_tokens }
            });
            out.push_str(&sse_frame(Some("message_delta"), &delta.to_string()));
            out.push_str(&sse_frame(
                Some("message_stop"),
                &json!({ "type": "message_stop" }).to_string(),
            ));
            return Some(out);
        }
        let chunk: ChatChunk = serde_json::from_str(data).ok()?;
        if let Some(usage) = chunk.usage {
            frames.output_tokens = usage.completion_tokens;
        }
        let mut out = String::new();

        for choice in &chunk.choices {
            if let Some(text) = choice.delta.content.as_ref().filter(|t| !t.is_empty()) {
                if frames.open_block != Some(BlockKind::Text) {
                    open_block(frames, BlockKind::Text, json!({ "type": "text", "text": "" }), &mut out);
                }
                let ev = json!({
                    "type": "content_block_delta",
                    "index": frames.open_index,
                    "delta": { "type": "text_delta", "text": text }
                });
                out.push_str(&sse_frame(Some("content_block_delta"), &ev.to_string()));
            }
            for tc in choice.delta.tool_calls.iter().flatten() {
                let function = tc.function.as_ref();
                if !frames.tool_blocks.contains_key(&tc.index)
                    && let (Some(id), Some(name)) = (&tc.id, function.and_then(|f| f.name.as_ref()))
                {
                    let block = json!({ "type": "tool_use", "id": id, "name": name, "input": {} });
                    let index = open_block(frames, BlockKind::ToolUse, block, &mut out);
                    frames.tool_blocks.insert(tc.index, index);
                }
                let Some(index) = frames.tool_blocks.get(&tc.index).copied() else {
                    continue;
                };
                if let Some(args) = function.and_then(|f| f.arguments.as_ref()).filter(|a| !a.is_empty()) {
                    let ev = json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "input_json_delta", "partial_json": args }
                    });
                    out.push_str(&sse_frame(Some("content_block_delta"), &ev.to_string()));
                }
            }
            if let Some(finish) = choice.finish_reason.as_deref() {
                frames.finish_reason = Some(finish.to_string());
                close_block(frames, &mut out);
            }
        }

        if out.is_empty() { None } else { Some(out) }
    }

    fn format_stream_error(&self, message: &str) -> String {
        let ev = json!({
            "type": "error",
            "error": { "type": "api_error", "message": message }
        });
        sse_frame(Some("error"), &ev.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{Delta, FunctionCallDelta, ToolCallDelta, done_line};

    #[test]
    fn parse_maps_system_blocks_and_tools() {
        let raw = br#"{
            "model": "claude-3-5-sonnet",
            "max_tokens": 256,
            "system": [{"type":"text","text":"You are terse."}],
            "messages": [
                {"role":"user","content":"What is the weather?"},
                {"role":"assistant","content":[
                    {"type":"text","text":"Let me check."},
                    {"type":"tool_use","id":"toolu_1","name":"get_weather","input":{"city":"Paris"}}
                ]},
                {"role":"user","content":[
                    {"type":"tool_result","tool_use_id":"toolu_1","content":[{"type":"text","text":"18C"}]},
                    {"type":"text","text":"Thanks"}
                ]}
            ],
            "tools": [{"name":"get_weather","description":"Weather","input_schema":{"type":"object","properties":{"city":{"type":"string"}}}}],
            "tool_choice": {"type":"any"},
            "stop_sequences": ["\n\nHuman:"],
            "stream": true
        }"#;
        let req = AnthropicConverter.parse_request(raw, None).unwrap();
        assert_eq!(req.model, "claude-3-5-sonnet");
        assert_eq!(req.max_tokens, Some(256));
        assert!(req.stream);
        assert_eq!(req.messages[0], ChatMessage::text("system", "You are terse."));
        assert_eq!(req.messages[1].content.as_deref(), Some("What is the weather?"));

        let assistant = &req.messages[2];
        assert_eq!(assistant.content.as_deref(), Some("Let me check."));
        let call = &assistant.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.function.name, "get_weather");
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args["city"], "Paris");

        assert_eq!(req.messages[3].role, "tool");
        assert_eq!(req.messages[3].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(req.messages[3].content.as_deref(), Some("18C"));
        assert_eq!(req.messages[4].content.as_deref(), Some("Thanks"));

        let tool = &req.tools.as_ref().unwrap()[0];
        assert_eq!(tool.function.name, "get_weather");
        assert_eq!(req.tool_choice, Some(json!("required")));
        assert_eq!(req.stop, Some(vec!["\n\nHuman:".to_string()]));
    }

    #[test]
    fn response_formats_blocks_and_stop_reason() {
        let resp = ChatResponse {
            id: "chatcmpl-1".into(),
            model: "claude-3-5-sonnet".into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".into(),
                    content: Some("Checking".into()),
                    tool_calls: Some(vec![ToolCall {
                        id: "toolu_9".into(),
                        kind: "function".into(),
                        function: FunctionCall {
                            name: "lookup".into(),
                            arguments: "{\"q\":1}".into(),
                        },
                    }]),
                    ..Default::default()
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: Usage::new(11, 7),
            ..Default::default()
        };
        let bytes = AnthropicConverter.format_response(&resp).unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["id"], "msg_chatcmpl-1");
        assert_eq!(v["content"][0], json!({"type":"text","text":"Checking"}));
        assert_eq!(v["content"][1]["type"], "tool_use");
        assert_eq!(v["content"][1]["input"]["q"], 1);
        assert_eq!(v["stop_reason"], "tool_use");
        assert_eq!(v["usage"]["input_tokens"], 11);
        assert_eq!(v["usage"]["output_tokens"], 7);

        let mut plain = resp.clone();
        plain.choices[0].finish_reason = Some("length".into());
        plain.choices[0].message.tool_calls = None;
        let v: Value = serde_json::from_slice(&AnthropicConverter.format_response(&plain).unwrap()).unwrap();
        assert_eq!(v["stop_reason"], "max_tokens");
    }

    #[test]
    fn upstream_request_extracts_system_and_merges_tool_results() {
        let req = ChatRequest {
            model: "claude-x".into(),
            messages: vec![
                ChatMessage::text("system", "rules"),
                ChatMessage::text("user", "hi"),
                ChatMessage {
                    role: "assistant".into(),
                    tool_calls: Some(vec![ToolCall {
                        id: "t1".into(),
                        kind: "function".into(),
                        function: FunctionCall { name: "f".into(), arguments: "{}".into() },
                    }]),
                    ..Default::default()
                },
                ChatMessage {
                    role: "tool".into(),
                    content: Some("ok".into()),
                    tool_call_id: Some("t1".into()),
                    ..Default::default()
                },
                ChatMessage::text("user", "and?"),
            ],
            ..Default::default()
        };
        let wire = from_canonical_request(&req, "claude-x");
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(wire.system, Some(json!("rules")));
        assert_eq!(wire.messages.len(), 3);
        assert_eq!(wire.messages[0].content, json!("hi"));
        assert_eq!(wire.messages[1].content[0]["type"], "tool_use");
        // tool_result 与随后的 user 文本合并成一条 user 消息
        assert_eq!(wire.messages[2].role, "user");
        assert_eq!(wire.messages[2].content[0]["type"], "tool_result");
        assert_eq!(wire.messages[2].content[1]["text"], "and?");
        assert_eq!(wire.stream, None);
    }

    /// 依次取出帧里的 `event:` 名称和对应的 index
    fn events(out: &str) -> Vec<(String, Option<u64>)> {
        out.split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| {
                let mut lines = f.lines();
                let name = lines.next().unwrap().trim_start_matches("event: ").to_string();
                let data: Value =
                    serde_json::from_str(lines.next().unwrap().trim_start_matches("data: ")).unwrap();
                (name, data["index"].as_u64())
            })
            .collect()
    }

    fn tool_delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> String {
        ChatChunk::new("c", "m", 1)
            .with_delta(
                Delta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: id.map(str::to_string),
                        kind: id.map(|_| "function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: name.map(str::to_string),
                            arguments: Some(args.to_string()),
                        }),
                    }]),
                    ..Default::default()
                },
                None,
            )
            .to_data_line()
    }

    #[test]
    fn stream_chunks_map_to_anthropic_events() {
        let mut frames = StreamFrames::default();
        AnthropicConverter.stream_preamble("c", "m", &mut frames).unwrap();

        let text = ChatChunk::new("c", "m", 1)
            .with_delta(Delta::content("Hi"), None)
            .to_data_line();
        let out = AnthropicConverter.format_stream_chunk(&text, &mut frames).unwrap();
        assert!(out.starts_with("event: content_block_delta\ndata: "));
        assert!(out.contains("\"text_delta\""));

        let fin = ChatChunk::new("c", "m", 1).with_delta(Delta::default(), Some("stop".into()));
        let out = AnthropicConverter.format_stream_chunk(&fin.to_data_line(), &mut frames).unwrap();
        assert_eq!(events(&out), vec![("content_block_stop".to_string(), Some(0))]);

        // OpenAI 的用量在结束块之后单独到达
        let mut usage = ChatChunk::new("c", "m", 1);
        usage.usage = Some(Usage::new(3, 9));
        assert_eq!(AnthropicConverter.format_stream_chunk(&usage.to_data_line(), &mut frames), None);

        let done = AnthropicConverter.format_stream_chunk(&done_line(), &mut frames).unwrap();
        assert_eq!(
            events(&done),
            vec![("message_delta".to_string(), None), ("message_stop".to_string(), None)]
        );
        assert!(done.contains("\"stop_reason\":\"end_turn\""));
        assert!(done.contains("\"output_tokens\":9"));

        assert_eq!(AnthropicConverter.format_stream_chunk("data: {broken", &mut frames), None);
    }

    #[test]
    fn tool_call_blocks_open_and_close_in_order() {
        let mut frames = StreamFrames::default();
        let mut out = AnthropicConverter.stream_preamble("c", "m", &mut frames).unwrap();
        let lines = [
            ChatChunk::new("c", "m", 1).with_delta(Delta::content("Checking"), None).to_data_line(),
            tool_delta(0, Some("call_1"), Some("lookup"), "{\"q\":"),
            tool_delta(0, None, None, "1}"),
            tool_delta(1, Some("call_2"), Some("fetch"), "{}"),
            ChatChunk::new("c", "m", 1)
                .with_delta(Delta::default(), Some("tool_calls".into()))
                .to_data_line(),
            done_line(),
        ];
        for line in &lines {
            if let Some(frame) = AnthropicConverter.format_stream_chunk(line, &mut frames) {
                out.push_str(&frame);
            }
        }

        let expected: Vec<(&str, Option<u64>)> = vec![
            ("message_start", None),
            ("content_block_start", Some(0)),
            ("content_block_delta", Some(0)),
            ("content_block_stop", Some(0)),
            ("content_block_start", Some(1)),
            ("content_block_delta", Some(1)),
            ("content_block_delta", Some(1)),
            ("content_block_stop", Some(1)),
            ("content_block_start", Some(2)),
            ("content_block_delta", Some(2)),
            ("content_block_stop", Some(2)),
            ("message_delta", None),
            ("message_stop", None),
        ];
        let got = events(&out);
        assert_eq!(
            got.iter().map(|(n, i)| (n.as_str(), *i)).collect::<Vec<_>>(),
            expected
        );
        assert!(out.contains("\"stop_reason\":\"tool_use\""));
        assert!(out.contains("\"name\":\"fetch\""));
    }

    #[test]
    fn preamble_opens_message_and_text_block() {
        let mut frames = StreamFrames::default();
        let pre = AnthropicConverter.stream_preamble("abc", "claude-x", &mut frames).unwrap();
        assert!(pre.starts_with("event: message_start\n"));
        assert!(pre.contains("\"id\":\"msg_abc\""));
        assert!(pre.contains("event: content_block_start\n"));
        assert_eq!(frames.open_block, Some(BlockKind::Text));
        assert_eq!(frames.next_index, 1);
    }
}
