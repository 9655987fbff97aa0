//! Kiro 账号池的上游：CodeWhisperer `generateAssistantResponse`
//!
//! 请求是整段会话状态（history + currentMessage），响应是 AWS event stream 二进制帧，
//! 流式和非流式走同一个接口。上游不报 token 用量，按字符数估算。

use std::sync::LazyLock;

use reqwest::RequestBuilder;
use serde::Serialize;
use serde_json::{Value, json};

use super::eventstream::{decode_all, exception_error};
use super::{StreamFraming, StreamState, UpstreamAdapter, endpoint};
use crate::config::ProviderKind;
use crate::error::{GatewayError, Result};
use crate::pool::UpstreamAuth;
use crate::protocol::canonical::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, ToolCall, Usage,
};

const ORIGIN: &str = "AI_EDITOR";
const TOOL_NAME_LIMIT: usize = 64;
const TOOL_DESCRIPTION_LIMIT: usize = 10237;
const EVENT_STREAM_MIME: &str = "application/vnd.amazon.eventstream";

/// 每个进程一个机器标识，放在 x-amz-user-agent 里
static MACHINE_ID: LazyLock<String> = LazyLock::new(|| uuid::Uuid::new_v4().simple().to_string());

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroRequest {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<KiroMessage>,
    pub current_message: KiroMessage,
    pub chat_trigger_type: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KiroMessage {
    UserInputMessage(UserInput),
    AssistantResponseMessage(AssistantResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
    pub content: String,
    pub model_id: String,
    pub origin: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<MessageContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<KiroTool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub name: String,
    pub tool_use_id: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub status: &'static str,
    pub content: Vec<ToolResultText>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResultText {
    pub text: String,
}

impl KiroMessage {
    fn user(content: impl Into<String>, model_id: &str) -> Self {
        Self::UserInputMessage(UserInput {
            content: content.into(),
            model_id: model_id.to_string(),
            origin: ORIGIN,
            user_input_message_context: None,
        })
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self::AssistantResponseMessage(AssistantResponse {
            content: content.into(),
            tool_uses: Vec::new(),
        })
    }

    fn tool_results(content: &str, results: Vec<ToolResult>, model_id: &str) -> Self {
        Self::UserInputMessage(UserInput {
            content: content.to_string(),
            model_id: model_id.to_string(),
            origin: ORIGIN,
            user_input_message_context: Some(MessageContext {
                tools: Vec::new(),
                tool_results: results,
            }),
        })
    }

    fn is_user(&self) -> bool {
        matches!(self, Self::UserInputMessage(_))
    }

    fn has_tool_results(&self) -> bool {
        matches!(self, Self::UserInputMessage(u)
            if u.user_input_message_context.as_ref().is_some_and(|c| !c.tool_results.is_empty()))
    }
}

/// 规范请求 -> Kiro 会话状态；系统提示并入第一条用户消息，工具定义只挂在当前消息上
pub fn to_kiro_request(req: &ChatRequest, conversation_id: &str) -> KiroRequest {
    let model_id = req.model.as_str();
    let system = req
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .filter_map(|m| m.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    let mut system = Some(system).filter(|s| !s.is_empty());

    let turns: Vec<&ChatMessage> = req.messages.iter().filter(|m| m.role != "system").collect();
    let mut messages = Vec::new();
    let mut pending_results = Vec::new();
    for (i, msg) in turns.iter().enumerate() {
        match msg.role.as_str() {
            "user" => {
                let mut content = msg.content.clone().unwrap_or_default();
                if let Some(sys) = system.take() {
                    content = format!("{}\n\n{}", sys, content);
                }
                if content.is_empty() {
                    content = "Continue".to_string();
                }
                messages.push(KiroMessage::user(content, model_id));
            }
            "assistant" => {
                let tool_uses: Vec<ToolUse> = msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|call| ToolUse {
                        name: call.function.name.clone(),
                        tool_use_id: call.id.clone(),
                        input: serde_json::from_str::<Value>(&call.function.arguments)
                            .ok()
                            .filter(Value::is_object)
                            .unwrap_or_else(|| json!({})),
                    })
                    .collect();
                let content = match msg.content.as_deref().filter(|c| !c.is_empty()) {
                    Some(c) => c.to_string(),
                    None if !tool_uses.is_empty() => "Using tools.".to_string(),
                    None => "I understand.".to_string(),
                };
                messages.push(KiroMessage::AssistantResponseMessage(AssistantResponse {
                    content,
                    tool_uses,
                }));
            }
            "tool" => {
                if let Some(id) = msg.tool_call_id.clone() {
                    pending_results.push(ToolResult {
                        tool_use_id: id,
                        status: "success",
                        content: vec![ToolResultText {
                            text: msg.content.clone().unwrap_or_default(),
                        }],
                    });
                }
                let next_is_tool = turns.get(i + 1).is_some_and(|m| m.role == "tool");
                if !next_is_tool && !pending_results.is_empty() {
                    messages.push(KiroMessage::tool_results(
                        "Tool results provided.",
                        std::mem::take(&mut pending_results),
                        model_id,
                    ));
                }
            }
            _ => {}
        }
    }

    let mut history = sanitize(messages, model_id);
    let mut current = match history.pop() {
        Some(KiroMessage::UserInputMessage(u)) => u,
        // sanitize 之后最后一条一定是用户消息
        Some(other) => {
            history.push(other);
            user_input("Continue", model_id)
        }
        None => user_input("Hello", model_id),
    };
    if let Some(sys) = system {
        current.content = format!("{}\n\n{}", sys, current.content);
    }

    let tools: Vec<KiroTool> = req
        .tools
        .iter()
        .flatten()
        .map(|tool| {
            let f = &tool.function;
            let mut description = f
                .description
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format!("Tool: {}", f.name));
            if description.len() > TOOL_DESCRIPTION_LIMIT {
                let cut = floor_char_boundary(&description, TOOL_DESCRIPTION_LIMIT);
                description.truncate(cut);
                description.push_str("...");
            }
            KiroTool {
                tool_specification: ToolSpecification {
                    name: shorten_tool_name(&f.name),
                    description,
                    input_schema: InputSchema {
                        json: f.parameters.clone().unwrap_or_else(|| json!({"type": "object"})),
                    },
                },
            }
        })
        .collect();
    if !tools.is_empty() {
        current
            .user_input_message_context
            .get_or_insert_with(MessageContext::default)
            .tools = tools;
    }

    let inference = InferenceConfig {
        max_tokens: req.max_tokens.filter(|n| *n > 0),
        temperature: req.temperature.filter(|t| *t > 0.0),
        top_p: req.top_p.filter(|p| *p > 0.0),
    };

    KiroRequest {
        conversation_state: ConversationState {
            conversation_id: conversation_id.to_string(),
            history,
            current_message: KiroMessage::UserInputMessage(current),
            chat_trigger_type: "MANUAL",
        },
        inference_config: (inference != InferenceConfig::default()).then_some(inference),
    }
}

fn user_input(content: &str, model_id: &str) -> UserInput {
    UserInput {
        content: content.to_string(),
        model_id: model_id.to_string(),
        origin: ORIGIN,
        user_input_message_context: None,
    }
}

/// 会话必须以用户消息开头和结尾、两种角色交替，每次工具调用后必须跟着结果
fn sanitize(messages: Vec<KiroMessage>, model_id: &str) -> Vec<KiroMessage> {
    if messages.is_empty() {
        return vec![KiroMessage::user("Hello", model_id)];
    }

    let mut messages = messages;
    if !messages[0].is_user() {
        messages.insert(0, KiroMessage::user("Hello", model_id));
    }

    // 空的用户消息（第一条除外）去掉
    let messages: Vec<KiroMessage> = messages
        .into_iter()
        .enumerate()
        .filter(|(i, m)| match m {
            KiroMessage::UserInputMessage(u) => {
                *i == 0 || !u.content.trim().is_empty() || m.has_tool_results()
            }
            KiroMessage::AssistantResponseMessage(_) => true,
        })
        .map(|(_, m)| m)
        .collect();

    // 没有结果的工具调用补一条失败结果
    let mut with_results = Vec::with_capacity(messages.len());
    for (i, msg) in messages.iter().enumerate() {
        with_results.push(msg.clone());
        if let KiroMessage::AssistantResponseMessage(a) = msg
            && !a.tool_uses.is_empty()
            && !messages.get(i + 1).is_some_and(KiroMessage::has_tool_results)
        {
            let failed = a
                .tool_uses
                .iter()
                .map(|t| ToolResult {
                    tool_use_id: t.tool_use_id.clone(),
                    status: "error",
                    content: vec![ToolResultText {
                        text: "Tool execution failed".to_string(),
                    }],
                })
                .collect();
            with_results.push(KiroMessage::tool_results("", failed, model_id));
        }
    }

    let mut alternating: Vec<KiroMessage> = Vec::with_capacity(with_results.len());
    for msg in with_results {
        match alternating.last() {
            Some(prev) if prev.is_user() && msg.is_user() => {
                alternating.push(KiroMessage::assistant("understood"));
            }
            Some(prev) if !prev.is_user() && !msg.is_user() => {
                alternating.push(KiroMessage::user("Continue", model_id));
            }
            _ => {}
        }
        alternating.push(msg);
    }

    if alternating.last().is_some_and(|m| !m.is_user()) {
        alternating.push(KiroMessage::user("Continue", model_id));
    }
    alternating
}

/// 上游限制工具名 64 字符；MCP 工具保留 `mcp__` 前缀和最后一段
fn shorten_tool_name(name: &str) -> String {
    if name.len() <= TOOL_NAME_LIMIT {
        return name.to_string();
    }
    if name.starts_with("mcp__")
        && let Some(last) = name.rfind("__").filter(|i| *i > 5)
    {
        let short = format!("mcp__{}", &name[last + 2..]);
        if short.len() <= TOOL_NAME_LIMIT {
            return short;
        }
    }
    name[..floor_char_boundary(name, TOOL_NAME_LIMIT)].to_string()
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    (0..=max.min(s.len()))
        .rev()
        .find(|i| s.is_char_boundary(*i))
        .unwrap_or(0)
}

/// 约 4 个字符一个 token
fn estimate_tokens(chars: usize) -> u32 {
    (chars / 4) as u32
}

/// 取出事件本体：载荷可能直接是事件，也可能包在事件名下
fn event_body<'a>(event: &str, v: &'a Value) -> &'a Value {
    v.get(event)
        .or_else(|| v.get("assistantResponseEvent"))
        .or_else(|| v.get("toolUseEvent"))
        .unwrap_or(v)
}

fn text_content(body: &Value) -> Option<&str> {
    // 追问建议不是回答内容
    let followup = body.get("followupPrompt").is_some_and(|f| !f.is_null());
    body.get("content").and_then(Value::as_str).filter(|_| !followup)
}

/// 非流式聚合时逐个工具调用拼参数
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

fn finalize_arguments(raw: &str) -> String {
    if raw.trim().is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => v.to_string(),
        Err(_) => json!({
            "_error": "Tool input truncated by upstream",
            "_partialInput": raw.chars().take(500).collect::<String>(),
        })
        .to_string(),
    }
}

pub struct KiroAdapter;

impl UpstreamAdapter for KiroAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kiro
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
        req: &ChatRequest,
    ) -> RequestBuilder {
        let invocation = uuid::Uuid::new_v4().to_string();
        let body = to_kiro_request(req, &invocation);
        let token = match auth {
            UpstreamAuth::ApiKey(k) | UpstreamAuth::Bearer(k) => k,
        };
        let accept = if req.stream { EVENT_STREAM_MIME } else { "application/json" };
        client
            .post(endpoint(base_url, "/generateAssistantResponse"))
            .bearer_auth(token)
            .header("accept", accept)
            .header("amz-sdk-invocation-id", invocation)
            .header("amz-sdk-request", "attempt=1; max=1")
            .header("x-amzn-kiro-agent-mode", "vibe")
            .header(
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.0 KiroIDE-0.8.140-{}", MACHINE_ID.as_str()),
            )
            .header(
                "user-agent",
                "aws-sdk-js/1.0.0 ua/2.1 os/linux lang/js md/nodejs#18.0.0 api/codewhispererruntime#1.0.0 m/E",
            )
            .json(&body)
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<ChatResponse> {
        let mut content = String::new();
        let mut tools: Vec<PendingTool> = Vec::new();
        for frame in decode_all(body)? {
            if frame.is_exception() {
                return Err(exception_error(&frame));
            }
            let Ok(v) = serde_json::from_slice::<Value>(&frame.payload) else {
                continue;
            };
            let event = event_body(frame.event_type(), &v);
            if let Some(text) = text_content(event) {
                content.push_str(text);
            }
            let (Some(name), Some(id)) = (
                event.get("name").and_then(Value::as_str),
                event.get("toolUseId").and_then(Value::as_str),
            ) else {
                continue;
            };
            if tools.last().is_none_or(|t| t.id != id) {
                tools.push(PendingTool {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: String::new(),
                });
            }
            if let Some(tool) = tools.last_mut() {
                match event.get("input") {
                    Some(Value::String(fragment)) => tool.arguments.push_str(fragment),
                    Some(obj @ Value::Object(_)) => tool.arguments = obj.to_string(),
                    _ => {}
                }
            }
        }

        // 同一个 toolUseId 只保留第一次
        let mut seen = std::collections::HashSet::new();
        let tool_calls: Vec<ToolCall> = tools
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .map(|t| ToolCall {
                id: t.id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name: t.name,
                    arguments: finalize_arguments(&t.arguments),
                },
            })
            .collect();

        let args_chars: usize = tool_calls.iter().map(|t| t.function.arguments.len()).sum();
        let completion = estimate_tokens(content.len() + args_chars);
        let finish = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
        Ok(ChatResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(content),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    ..Default::default()
                },
                finish_reason: Some(finish.to_string()),
            }],
            usage: Usage::new(completion / 2, completion),
            cached: false,
        })
    }

    fn translate_event(&self, event: &str, data: &str, state: &mut StreamState) -> Result<Vec<String>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Skipping malformed Kiro event: {}", e);
                return Ok(Vec::new());
            }
        };
        let body = event_body(event, &v);
        let mut out = Vec::new();
        if let Some(text) = text_content(body).filter(|t| !t.is_empty()) {
            state.emitted_chars += text.len();
            out.push(state.text_line(text));
        }
        if let (Some(name), Some(id)) = (
            body.get("name").and_then(Value::as_str),
            body.get("toolUseId").and_then(Value::as_str),
        ) {
            let (index, fresh) = state.keyed_tool_index(id);
            if fresh {
                out.push(state.tool_start_line(index, id, name));
            }
            let fragment = match body.get("input") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(obj @ Value::Object(_)) => Some(obj.to_string()),
                _ => None,
            };
            if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
                state.emitted_chars += fragment.len();
                out.extend(state.tool_args_line(index, &fragment));
            }
        }
        Ok(out)
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::AwsEventStream
    }

    /// 上游流没有结束事件和用量，结束块在这里补
    fn finish_stream(&self, state: &mut StreamState, request: &ChatRequest) -> Vec<String> {
        let prompt_chars: usize = request
            .messages
            .iter()
            .map(|m| m.content.as_deref().map_or(0, str::len))
            .sum();
        state.set_prompt_tokens(estimate_tokens(prompt_chars));
        state.set_completion_tokens(estimate_tokens(state.emitted_chars));
        let finish = if state.has_tool_calls() { "tool_calls" } else { "stop" };
        vec![state.finish_line(finish), state.done_line()]
    }

    /// 用额度查询接口验证令牌
    fn probe_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        auth: UpstreamAuth<'_>,
    ) -> RequestBuilder {
        let token = match auth {
            UpstreamAuth::ApiKey(k) | UpstreamAuth::Bearer(k) => k,
        };
        client
            .get(endpoint(base_url, "/getUsageLimits"))
            .query(&[("origin", ORIGIN), ("resourceType", "AGENTIC_REQUEST")])
            .bearer_auth(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{ChatChunk, FunctionDefinition, Tool, sse_data};
    use crate::providers::eventstream::tests::{assistant_event, event_frame};

    fn parse(line: &str) -> ChatChunk {
        serde_json::from_str(sse_data(line).unwrap()).unwrap()
    }

    fn tool_event(payload: Value) -> Vec<u8> {
        event_frame(
            &[(":message-type", "event"), (":event-type", "toolUseEvent")],
            payload.to_string().as_bytes(),
        )
    }

    fn conversation() -> ChatRequest {
        let call = ToolCall {
            id: "tooluse_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "lookup".into(),
                arguments: r#"{"q":"rust"}"#.into(),
            },
        };
        ChatRequest {
            model: "claude-sonnet-4".into(),
            messages: vec![
                ChatMessage::text("system", "be brief"),
                ChatMessage::text("user", "find rust"),
                ChatMessage {
                    role: "assistant".into(),
                    tool_calls: Some(vec![call]),
                    ..Default::default()
                },
                ChatMessage {
                    role: "tool".into(),
                    content: Some("found".into()),
                    tool_call_id: Some("tooluse_1".into()),
                    ..Default::default()
                },
                ChatMessage::text("user", "thanks"),
            ],
            tools: Some(vec![Tool {
                kind: "function".into(),
                function: FunctionDefinition {
                    name: format!("mcp__server__{}", "x".repeat(80)),
                    description: None,
                    parameters: Some(json!({"type": "object"})),
                },
            }]),
            max_tokens: Some(256),
            ..Default::default()
        }
    }

    #[test]
    fn conversation_becomes_history_and_current_message() {
        let body = serde_json::to_value(to_kiro_request(&conversation(), "conv-1")).unwrap();
        let state = &body["conversationState"];
        assert_eq!(state["conversationId"], "conv-1");
        assert_eq!(state["chatTriggerType"], "MANUAL");
        let history = state["history"].as_array().unwrap();
        // user, assistant(tool use), user(tool results), 为交替补的 assistant
        assert_eq!(history.len(), 4);
        let first = &history[0]["userInputMessage"];
        assert_eq!(first["content"], "be brief\n\nfind rust");
        assert_eq!(first["modelId"], "claude-sonnet-4");
        assert_eq!(first["origin"], "AI_EDITOR");
        let assistant = &history[1]["assistantResponseMessage"];
        assert_eq!(assistant["content"], "Using tools.");
        assert_eq!(assistant["toolUses"][0]["input"]["q"], "rust");
        let results = &history[2]["userInputMessage"];
        assert_eq!(results["content"], "Tool results provided.");
        let result = &results["userInputMessageContext"]["toolResults"][0];
        assert_eq!(result["toolUseId"], "tooluse_1");
        assert_eq!(result["status"], "success");
        assert_eq!(result["content"][0]["text"], "found");
        assert_eq!(history[3]["assistantResponseMessage"]["content"], "understood");

        let current = &state["currentMessage"]["userInputMessage"];
        assert_eq!(current["content"], "thanks");
        let spec = &current["userInputMessageContext"]["tools"][0]["toolSpecification"];
        // 去掉 server 段后仍超长，只能截断
        assert_eq!(spec["name"].as_str().unwrap().len(), 64);
        assert!(spec["name"].as_str().unwrap().starts_with("mcp__server__x"));
        assert_eq!(shorten_tool_name(&format!("mcp__srv__{}", "y".repeat(59))), format!("mcp__{}", "y".repeat(59)));
        assert!(spec["description"].as_str().unwrap().starts_with("Tool: mcp__server__"));
        assert_eq!(body["inferenceConfig"], json!({"maxTokens": 256}));
        // 历史里的消息不带工具定义
        assert!(history.iter().all(|m| m["userInputMessage"]["userInputMessageContext"]["tools"].is_null()));
    }

    #[test]
    fn sanitize_fills_missing_turns() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![
                ChatMessage::text("assistant", "hi there"),
                ChatMessage::text("assistant", ""),
            ],
            ..Default::default()
        };
        let body = serde_json::to_value(to_kiro_request(&req, "c")).unwrap();
        let state = &body["conversationState"];
        let history = state["history"].as_array().unwrap();
        assert_eq!(history[0]["userInputMessage"]["content"], "Hello");
        assert_eq!(history[1]["assistantResponseMessage"]["content"], "hi there");
        assert_eq!(history[2]["userInputMessage"]["content"], "Continue");
        assert_eq!(history[3]["assistantResponseMessage"]["content"], "I understand.");
        assert_eq!(state["currentMessage"]["userInputMessage"]["content"], "Continue");
        assert!(body.get("inferenceConfig").is_none());

        // 只有系统提示
        let only_system = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::text("system", "rules")],
            ..Default::default()
        };
        let body = serde_json::to_value(to_kiro_request(&only_system, "c")).unwrap();
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "rules\n\nHello"
        );
    }

    #[test]
    fn unanswered_tool_use_gets_failed_result() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![
                ChatMessage::text("user", "go"),
                ChatMessage {
                    role: "assistant".into(),
                    content: Some("calling".into()),
                    tool_calls: Some(vec![ToolCall {
                        id: "t9".into(),
                        kind: "function".into(),
                        function: FunctionCall {
                            name: "f".into(),
                            arguments: "not json".into(),
                        },
                    }]),
                    ..Default::default()
                },
                ChatMessage::text("user", "and?"),
            ],
            ..Default::default()
        };
        let body = serde_json::to_value(to_kiro_request(&req, "c")).unwrap();
        let history = body["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history[1]["assistantResponseMessage"]["toolUses"][0]["input"], json!({}));
        let failed = &history[2]["userInputMessage"]["userInputMessageContext"]["toolResults"][0];
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["toolUseId"], "t9");
        assert_eq!(history[3]["assistantResponseMessage"]["content"], "understood");
        assert_eq!(body["conversationState"]["currentMessage"]["userInputMessage"]["content"], "and?");
    }

    #[test]
    fn request_targets_generate_endpoint_with_kiro_headers() {
        let client = reqwest::Client::new();
        let mut req = conversation();
        req.stream = true;
        let built = KiroAdapter
            .build_request(&client, "http://127.0.0.1:1/", UpstreamAuth::Bearer("aoa-token"), &req)
            .build()
            .unwrap();
        assert_eq!(built.url().path(), "/generateAssistantResponse");
        let h = built.headers();
        assert_eq!(h["authorization"], "Bearer aoa-token");
        assert_eq!(h["accept"], EVENT_STREAM_MIME);
        assert_eq!(h["x-amzn-kiro-agent-mode"], "vibe");
        assert_eq!(h["amz-sdk-request"], "attempt=1; max=1");
        let body: Value = serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        // 会话 ID 与调用 ID 一致
        assert_eq!(body["conversationState"]["conversationId"], h["amz-sdk-invocation-id"].to_str().unwrap());

        let probe = KiroAdapter
            .probe_request(&client, "http://127.0.0.1:1", UpstreamAuth::Bearer("aoa-token"))
            .build()
            .unwrap();
        assert_eq!(probe.url().path(), "/getUsageLimits");
        assert_eq!(probe.url().query(), Some("origin=AI_EDITOR&resourceType=AGENTIC_REQUEST"));
    }

    #[test]
    fn whole_body_aggregates_text_and_tool_calls() {
        let mut body = assistant_event("Hello ");
        body.extend(assistant_event("world"));
        body.extend(event_frame(
            &[(":event-type", "assistantResponseEvent")],
            br#"{"content":"Want more?","followupPrompt":{"content":"x"}}"#,
        ));
        body.extend(tool_event(json!({"name": "lookup", "toolUseId": "tu_1", "input": "{\"q\":"})));
        body.extend(tool_event(json!({"name": "lookup", "toolUseId": "tu_1", "input": "\"rust\"}"})));
        body.extend(tool_event(json!({"name": "lookup", "toolUseId": "tu_1", "stop": true})));
        body.extend(tool_event(json!({"name": "cut", "toolUseId": "tu_2", "input": "{\"a\":"})));

        let resp = KiroAdapter.parse_response(&body, "claude-sonnet-4").unwrap();
        let msg = resp.first_message().unwrap();
        assert_eq!(msg.content.as_deref(), Some("Hello world"));
        assert_eq!(resp.finish_reason(), Some("tool_calls"));
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);
        let broken: Value = serde_json::from_str(&calls[1].function.arguments).unwrap();
        assert_eq!(broken["_partialInput"], "{\"a\":");
        // (11 + 12 + 参数) / 4
        assert!(resp.usage.completion_tokens > 0);
        assert_eq!(resp.usage.prompt_tokens, resp.usage.completion_tokens / 2);
        assert_eq!(resp.model, "claude-sonnet-4");
    }

    #[test]
    fn exception_frames_fail_the_response() {
        let body = event_frame(
            &[(":message-type", "exception"), (":exception-type", "ThrottlingException")],
            br#"{"message":"Too many requests"}"#,
        );
        let err = KiroAdapter.parse_response(&body, "m").unwrap_err();
        match err {
            GatewayError::Upstream { status, message } => {
                assert_eq!(status, Some(429));
                assert!(message.contains("Too many requests"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let validation = event_frame(
            &[(":message-type", "exception"), (":exception-type", "ValidationException")],
            br#"{"message":"Improperly formed request"}"#,
        );
        let err = KiroAdapter.parse_response(&validation, "m").unwrap_err();
        assert!(err.is_request_fault());
    }

    #[test]
    fn stream_events_translate_and_finish_with_estimated_usage() {
        let mut s = StreamState::new("claude-sonnet-4");
        let mut lines = Vec::new();
        let events = [
            ("assistantResponseEvent", json!({"content": "Let me check"})),
            ("assistantResponseEvent", json!({"content": "", "followupPrompt": {"content": "more?"}})),
            ("toolUseEvent", json!({"name": "lookup", "toolUseId": "tu_1", "input": "{\"q\":"})),
            ("toolUseEvent", json!({"name": "lookup", "toolUseId": "tu_1", "input": "1}"})),
            ("toolUseEvent", json!({"name": "lookup", "toolUseId": "tu_1", "stop": true})),
        ];
        for (ev, data) in events {
            lines.extend(KiroAdapter.translate_event(ev, &data.to_string(), &mut s).unwrap());
        }
        assert_eq!(lines.len(), 4);
        assert_eq!(parse(&lines[0]).choices[0].delta.content.as_deref(), Some("Let me check"));
        let start = parse(&lines[1]);
        let tc = &start.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!((tc.index, tc.id.as_deref()), (0, Some("tu_1")));
        let args = parse(&lines[2]);
        let tc = &args.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.function.as_ref().unwrap().arguments.as_deref(), Some("{\"q\":"));

        let request = ChatRequest {
            model: "claude-sonnet-4".into(),
            messages: vec![ChatMessage::text("user", &"x".repeat(40))],
            ..Default::default()
        };
        let tail = KiroAdapter.finish_stream(&mut s, &request);
        assert_eq!(tail.len(), 2);
        let fin = parse(&tail[0]);
        assert_eq!(fin.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        // 12 + 5 + 2 = 19 个字符
        assert_eq!(fin.usage, Some(Usage::new(10, 4)));
        assert_eq!(tail[1], "data: [DONE]");
        assert!(s.done);
    }
}
