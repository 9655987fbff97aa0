use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::canonical::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, DONE_MARKER, FunctionCall,
    FunctionDefinition, Tool, ToolCall, Usage, sse_data,
};
use super::{Protocol, ProtocolConverter, StreamFrames, apply_model_override, ensure_messages};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default, alias = "system_instruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, alias = "generation_config", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    #[serde(default, alias = "tool_config", skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, alias = "function_call", skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(default, alias = "function_response", skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, alias = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, alias = "top_k", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, alias = "max_output_tokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, alias = "stop_sequences", skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, alias = "candidate_count", skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    #[serde(default, alias = "function_declarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

impl From<Usage> for UsageMetadata {
    fn from(u: Usage) -> Self {
        Self {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens,
            total_token_count: u.total_tokens,
        }
    }
}

pub fn finish_reason_to_gemini(finish: Option<&str>) -> &'static str {
    match finish {
        Some("stop") | Some("tool_calls") => "STOP",
        Some("length") => "MAX_TOKENS",
        Some("content_filter") => "SAFETY",
        _ => "OTHER",
    }
}

pub fn finish_reason_from_gemini(reason: Option<&str>, has_tool_calls: bool) -> Option<String> {
    let reason = reason?;
    let mapped = match reason {
        "STOP" if has_tool_calls => "tool_calls",
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    };
    Some(mapped.to_string())
}

fn tool_call_id(name: &str) -> String {
    format!("call_{}", name)
}

fn join_text(parts: &[Part]) -> Option<String> {
    let texts: Vec<&str> = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if texts.is_empty() { None } else { Some(texts.join("")) }
}

/// Gemini generateContent 请求 -> 规范请求；模型来自 URL，`model` 为空时留空
pub fn to_canonical_request(req: GenerateContentRequest, model: &str) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system_instruction.as_ref().and_then(|c| {
        let texts: Vec<&str> = c.parts.iter().filter_map(|p| p.text.as_deref()).collect();
        (!texts.is_empty()).then(|| texts.join("\n"))
    }) {
        messages.push(ChatMessage::text("system", system));
    }

    for content in &req.contents {
        let role = match content.role.as_deref() {
            Some("model") => "assistant",
            _ => "user",
        };
        let mut tool_calls = Vec::new();
        for part in &content.parts {
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    id: tool_call_id(&call.name),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                });
            }
            if let Some(resp) = &part.function_response {
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(resp.response.to_string()),
                    name: Some(resp.name.clone()),
                    tool_call_id: Some(tool_call_id(&resp.name)),
                    ..Default::default()
                });
            }
        }
        let text = join_text(&content.parts);
        if text.is_none() && tool_calls.is_empty() {
            continue;
        }
        messages.push(ChatMessage {
            role: role.to_string(),
            content: text,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..Default::default()
        });
    }

    let config = req.generation_config.unwrap_or_default();
    let tools: Vec<Tool> = req
        .tools
        .into_iter()
        .flatten()
        .flat_map(|t| t.function_declarations)
        .map(|d| Tool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: d.name,
                description: d.description,
                parameters: d.parameters,
            },
        })
        .collect();

    ChatRequest {
        model: model.to_string(),
        messages,
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        max_tokens: config.max_output_tokens,
        stop: config.stop_sequences,
        n: config.candidate_count,
        tools: (!tools.is_empty()).then_some(tools),
        ..Default::default()
    }
}

/// 规范请求 -> Gemini 请求（发往上游）
pub fn from_canonical_request(req: &ChatRequest) -> GenerateContentRequest {
    // tool 消息只带 tool_call_id，需要回查函数名
    let mut names_by_call: HashMap<&str, &str> = HashMap::new();
    for m in &req.messages {
        for call in m.tool_calls.iter().flatten() {
            names_by_call.insert(call.id.as_str(), call.function.name.as_str());
        }
    }

    let mut system = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    for m in &req.messages {
        let (role, parts) = match m.role.as_str() {
            "system" | "developer" => {
                if let Some(c) = &m.content {
                    system.push(Part::text(c.clone()));
                }
                continue;
            }
            "tool" => {
                let name = m
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| names_by_call.get(id).copied())
                    .or(m.name.as_deref())
                    .unwrap_or("tool")
                    .to_string();
                let raw = m.content.clone().unwrap_or_default();
                let response = match serde_json::from_str::<Value>(&raw) {
                    Ok(v @ Value::Object(_)) => v,
                    Ok(other) => json!({ "result": other }),
                    Err(_) => json!({ "result": raw }),
                };
                let part = Part {
                    function_response: Some(GeminiFunctionResponse { name, response }),
                    ..Default::default()
                };
                ("user", vec![part])
            }
            other => {
                let role = if other == "assistant" { "model" } else { "user" };
                let mut parts = Vec::new();
                if let Some(text) = m.content.as_ref().filter(|t| !t.is_empty()) {
                    parts.push(Part::text(text.clone()));
                }
                for call in m.tool_calls.iter().flatten() {
                    parts.push(Part {
                        function_call: Some(GeminiFunctionCall {
                            name: call.function.name.clone(),
                            args: serde_json::from_str(&call.function.arguments)
                                .unwrap_or_else(|_| json!({})),
                        }),
                        ..Default::default()
                    });
                }
                (role, parts)
            }
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content { role: None, parts: system }),
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_output_tokens: req.max_tokens,
            stop_sequences: req.stop.clone(),
            candidate_count: req.n,
        }),
        tools,
        tool_config: None,
    }
}

/// 上游 Gemini 响应 -> 规范响应
pub fn to_canonical_response(resp: GenerateContentResponse, model: &str) -> ChatResponse {
    let candidate = resp.candidates.into_iter().next().unwrap_or_default();
    let tool_calls: Vec<ToolCall> = candidate
        .content
        .parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .map(|call| ToolCall {
            id: tool_call_id(&call.name),
            kind: "function".to_string(),
            function: FunctionCall {
                name: call.name.clone(),
                arguments: call.args.to_string(),
            },
        })
        .collect();
    let usage = resp
        .usage_metadata
        .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
        .unwrap_or_default();
    let finish_reason =
        finish_reason_from_gemini(candidate.finish_reason.as_deref(), !tool_calls.is_empty());

    ChatResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(join_text(&candidate.content.parts).unwrap_or_default()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                ..Default::default()
            },
            finish_reason,
        }],
        usage,
        cached: false,
    }
}

fn message_parts(msg: &ChatMessage) -> Vec<Part> {
    let mut parts = Vec::new();
    if let Some(text) = &msg.content {
        parts.push(Part::text(text.clone()));
    }
    for call in msg.tool_calls.iter().flatten() {
        parts.push(Part {
            function_call: Some(GeminiFunctionCall {
                name: call.function.name.clone(),
                args: serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({})),
            }),
            ..Default::default()
        });
    }
    parts
}

/// 规范响应 -> Gemini 响应（返回给客户端）
pub fn from_canonical_response(resp: &ChatResponse) -> GenerateContentResponse {
    let candidates = resp
        .choices
        .iter()
        .map(|choice| Candidate {
            content: Content {
                role: Some("model".to_string()),
                parts: message_parts(&choice.message),
            },
            finish_reason: Some(finish_reason_to_gemini(choice.finish_reason.as_deref()).to_string()),
            index: choice.index,
        })
        .collect();
    GenerateContentResponse {
        candidates,
        usage_metadata: Some(resp.usage.into()),
        model_version: Some(resp.model.clone()),
    }
}

pub struct GeminiConverter;

impl ProtocolConverter for GeminiConverter {
    fn protocol(&self) -> Protocol {
        Protocol::Gemini
    }

    fn parse_request(&self, raw: &[u8], model_override: Option<&str>) -> Result<ChatRequest> {
        let wire: GenerateContentRequest = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("invalid Gemini request: {}", e)))?;
        let mut req = to_canonical_request(wire, "");
        apply_model_override(&mut req, model_override);
        ensure_messages(&req)?;
        Ok(req)
    }

    fn format_response(&self, response: &ChatResponse) -> Result<Vec<u8>> {
        serde_json::to_vec(&from_canonical_response(response))
            .map_err(|e| GatewayError::Format(e.to_string()))
    }

    fn format_stream_chunk(&self, line: &str, _frames: &mut StreamFrames) -> Option<String> {
        let data = sse_data(line)?;
        // NDJSON 流没有结束标记，连接关闭即结束
        if data == DONE_MARKER {
            return None;
        }
        let chunk: ChatChunk = serde_json::from_str(data).ok()?;
        let candidates: Vec<Candidate> = chunk
            .choices
            .iter()
            .filter_map(|choice| {
                let mut parts = Vec::new();
                if let Some(text) = choice.delta.content.as_ref().filter(|t| !t.is_empty()) {
                    parts.push(Part::text(text.clone()));
                }
                for tc in choice.delta.tool_calls.iter().flatten() {
                    let Some(f) = &tc.function else { continue };
                    let (Some(name), Some(args)) = (&f.name, &f.arguments) else { continue };
                    // 只转发参数已完整的函数调用
                    if let Ok(args) = serde_json::from_str::<Value>(args) {
                        parts.push(Part {
                            function_call: Some(GeminiFunctionCall { name: name.clone(), args }),
                            ..Default::default()
                        });
                    }
                }
                if parts.is_empty() && choice.finish_reason.is_none() {
                    return None;
                }
                Some(Candidate {
                    content: Content {
                        role: Some("model".to_string()),
                        parts,
                    },
                    finish_reason: choice
                        .finish_reason
                        .as_deref()
                        .map(|f| finish_reason_to_gemini(Some(f)).to_string()),
                    index: choice.index,
                })
            })
            .collect();
        if candidates.is_empty() && chunk.usage.is_none() {
            return None;
        }
        let out = GenerateContentResponse {
            candidates,
            usage_metadata: chunk.usage.map(Into::into),
            model_version: (!chunk.model.is_empty()).then(|| chunk.model.clone()),
        };
        serde_json::to_string(&out).ok().map(|s| format!("{}\n", s))
    }

    fn format_stream_error(&self, message: &str) -> String {
        let body = json!({
            "error": { "code": 502, "message": message, "status": "UNAVAILABLE" }
        });
        format!("{}\n", body)
    }

    fn stream_content_type(&self) -> &'static str {
        "application/x-ndjson"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{Delta, done_line};

    #[test]
    fn parse_maps_roles_system_config_and_functions() {
        let raw = br#"{
            "systemInstruction": {"parts": [{"text": "Answer in French."}]},
            "contents": [
                {"role": "user", "parts": [{"text": "Weather in Paris?"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"temp": 18}}}]}
            ],
            "generationConfig": {"temperature": 0.3, "topK": 40, "maxOutputTokens": 64, "stopSequences": ["END"]},
            "tools": [{"functionDeclarations": [{"name": "get_weather", "parameters": {"type": "object"}}]}]
        }"#;
        let req = GeminiConverter.parse_request(raw, Some("gemini-1.5-pro")).unwrap();
        assert_eq!(req.model, "gemini-1.5-pro");
        assert_eq!(req.messages[0], ChatMessage::text("system", "Answer in French."));
        assert_eq!(req.messages[1].role, "user");
        let call = &req.messages[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(req.messages[2].role, "assistant");
        assert_eq!(call.id, "call_get_weather");
        assert_eq!(req.messages[3].role, "tool");
        assert_eq!(req.messages[3].tool_call_id.as_deref(), Some("call_get_weather"));
        assert_eq!(req.temperature, Some(0.3));
        assert_eq!(req.top_k, Some(40));
        assert_eq!(req.max_tokens, Some(64));
        assert_eq!(req.stop, Some(vec!["END".to_string()]));
        assert_eq!(req.tools.as_ref().unwrap()[0].function.name, "get_weather");
    }

    #[test]
    fn parse_accepts_snake_case_fields() {
        let raw = br#"{"contents":[{"parts":[{"text":"hi"}]}],"generation_config":{"max_output_tokens":5}}"#;
        let req = GeminiConverter.parse_request(raw, Some("gemini-pro")).unwrap();
        assert_eq!(req.max_tokens, Some(5));
        assert_eq!(req.messages[0].role, "user");
    }

    #[test]
    fn response_uses_candidates_and_usage_metadata() {
        let resp = ChatResponse {
            id: "x".into(),
            model: "gemini-1.5-pro".into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::text("assistant", "Bonjour"),
                finish_reason: Some("length".into()),
            }],
            usage: Usage::new(4, 6),
            ..Default::default()
        };
        let v: Value = serde_json::from_slice(&GeminiConverter.format_response(&resp).unwrap()).unwrap();
        assert_eq!(v["candidates"][0]["content"]["role"], "model");
        assert_eq!(v["candidates"][0]["content"]["parts"][0]["text"], "Bonjour");
        assert_eq!(v["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(v["usageMetadata"]["totalTokenCount"], 10);
        assert_eq!(v["modelVersion"], "gemini-1.5-pro");
    }

    #[test]
    fn upstream_request_round_trips_tool_names() {
        let req = ChatRequest {
            model: "gemini-pro".into(),
            messages: vec![
                ChatMessage::text("system", "rules"),
                ChatMessage::text("user", "q"),
                ChatMessage {
                    role: "assistant".into(),
                    tool_calls: Some(vec![ToolCall {
                        id: "call_abc".into(),
                        kind: "function".into(),
                        function: FunctionCall { name: "lookup".into(), arguments: "{\"k\":1}".into() },
                    }]),
                    ..Default::default()
                },
                ChatMessage {
                    role: "tool".into(),
                    content: Some("42".into()),
                    tool_call_id: Some("call_abc".into()),
                    ..Default::default()
                },
            ],
            max_tokens: Some(32),
            ..Default::default()
        };
        let wire = from_canonical_request(&req);
        assert_eq!(wire.system_instruction.unwrap().parts[0].text.as_deref(), Some("rules"));
        assert_eq!(wire.contents.len(), 3);
        assert_eq!(wire.contents[1].role.as_deref(), Some("model"));
        let resp = wire.contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(resp.name, "lookup");
        assert_eq!(resp.response, json!({ "result": 42 }));
        assert_eq!(wire.generation_config.unwrap().max_output_tokens, Some(32));
    }

    #[test]
    fn stream_lines_become_ndjson_and_skip_noise() {
        let mut frames = StreamFrames::default();
        let line = ChatChunk::new("c", "gemini-pro", 1)
            .with_delta(Delta::content("Hel"), None)
            .to_data_line();
        let out = GeminiConverter.format_stream_chunk(&line, &mut frames).unwrap();
        assert!(out.ends_with('\n'));
        assert!(!out.starts_with("data:"));
        let v: Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(v["candidates"][0]["content"]["parts"][0]["text"], "Hel");

        let mut fin = ChatChunk::new("c", "gemini-pro", 1).with_delta(Delta::default(), Some("stop".into()));
        fin.usage = Some(Usage::new(2, 3));
        let v: Value =
            serde_json::from_str(GeminiConverter.format_stream_chunk(&fin.to_data_line(), &mut frames).unwrap().trim_end())
                .unwrap();
        assert_eq!(v["candidates"][0]["finishReason"], "STOP");
        assert_eq!(v["usageMetadata"]["candidatesTokenCount"], 3);

        assert_eq!(GeminiConverter.format_stream_chunk(&done_line(), &mut frames), None);
        assert_eq!(GeminiConverter.format_stream_chunk("data: {\"choices\":[{", &mut frames), None);
        let err = GeminiConverter.format_stream_error("boom");
        assert!(err.ends_with('\n'));
        assert!(err.contains("\"UNAVAILABLE\""));
    }
}
