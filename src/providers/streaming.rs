use std::collections::HashMap;

use crate::protocol::canonical::{
    ChatChunk, Delta, FunctionCallDelta, ToolCallDelta, Usage, done_line,
};

/// 单次上游流的翻译状态：上游事件 -> 规范 `data:` 行
#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    /// 已产出过 `data: [DONE]`
    pub done: bool,
    prompt_tokens: u32,
    /// 上游块序号 -> 工具调用序号
    tool_slots: HashMap<u32, u32>,
    /// 以字符串标识工具调用的上游（Kiro toolUseId）-> 上游块序号
    tool_keys: HashMap<String, u32>,
    /// 已输出的文本和工具参数字符数，上游不报用量时据此估算
    pub emitted_chars: usize,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            usage: None,
            finish_reason: None,
            done: false,
            prompt_tokens: 0,
            tool_slots: HashMap::new(),
            tool_keys: HashMap::new(),
            emitted_chars: 0,
        }
    }

    pub fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk::new(&self.id, &self.model, self.created).with_delta(delta, finish_reason)
    }

    pub fn line(&self, delta: Delta, finish_reason: Option<String>) -> String {
        self.chunk(delta, finish_reason).to_data_line()
    }

    pub fn text_line(&self, text: &str) -> String {
        self.line(Delta::content(text), None)
    }

    pub fn role_line(&self) -> String {
        self.line(
            Delta {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
            None,
        )
    }

    /// 结束块：带 finish_reason 和（如果有的话）usage
    pub fn finish_line(&mut self, finish_reason: &str) -> String {
        self.finish_reason = Some(finish_reason.to_string());
        let mut chunk = self.chunk(Delta::default(), Some(finish_reason.to_string()));
        chunk.usage = self.usage;
        chunk.to_data_line()
    }

    pub fn done_line(&mut self) -> String {
        self.done = true;
        done_line()
    }

    pub fn set_prompt_tokens(&mut self, tokens: u32) {
        self.prompt_tokens = tokens;
        let completion = self.usage.map(|u| u.completion_tokens).unwrap_or(0);
        self.usage = Some(Usage::new(tokens, completion));
    }

    pub fn set_completion_tokens(&mut self, tokens: u32) {
        self.usage = Some(Usage::new(self.prompt_tokens, tokens));
    }

    pub fn tool_start_line(&mut self, upstream_index: u32, id: &str, name: &str) -> String {
        let slot = self.tool_slots.len() as u32;
        self.tool_slots.insert(upstream_index, slot);
        self.tool_line(slot, Some(id), Some(name), Some(""))
    }

    pub fn tool_args_line(&self, upstream_index: u32, partial: &str) -> Option<String> {
        let slot = *self.tool_slots.get(&upstream_index)?;
        Some(self.tool_line(slot, None, None, Some(partial)))
    }

    /// 一次性给出完整参数的工具调用（Gemini）
    pub fn whole_tool_line(&mut self, id: &str, name: &str, arguments: &str) -> String {
        let slot = self.tool_slots.len() as u32;
        self.tool_slots.insert(u32::MAX - slot, slot);
        self.tool_line(slot, Some(id), Some(name), Some(arguments))
    }

    /// 按字符串标识取上游块序号；第二个值表示是否第一次出现
    pub fn keyed_tool_index(&mut self, key: &str) -> (u32, bool) {
        if let Some(index) = self.tool_keys.get(key) {
            return (*index, false);
        }
        let index = self.tool_keys.len() as u32;
        self.tool_keys.insert(key.to_string(), index);
        (index, true)
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_slots.is_empty()
    }

    fn tool_line(&self, slot: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> String {
        let delta = Delta {
            tool_calls: Some(vec![ToolCallDelta {
                index: slot,
                id: id.map(str::to_string),
                kind: id.map(|_| "function".to_string()),
                function: Some(FunctionCallDelta {
                    name: name.map(str::to_string),
                    arguments: args.map(str::to_string),
                }),
            }]),
            ..Default::default()
        };
        self.line(delta, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::sse_data;

    #[test]
    fn usage_accumulates_across_events() {
        let mut s = StreamState::new("claude-x");
        s.set_prompt_tokens(12);
        s.set_completion_tokens(30);
        assert_eq!(s.usage, Some(Usage::new(12, 30)));
        let line = s.finish_line("stop");
        let chunk: ChatChunk = serde_json::from_str(sse_data(&line).unwrap()).unwrap();
        assert_eq!(chunk.usage.unwrap().total_tokens, 42);
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn tool_slots_follow_start_order() {
        let mut s = StreamState::new("m");
        s.tool_start_line(1, "toolu_a", "first");
        s.tool_start_line(3, "toolu_b", "second");
        let line = s.tool_args_line(3, "{\"x\":").unwrap();
        let chunk: ChatChunk = serde_json::from_str(sse_data(&line).unwrap()).unwrap();
        let tc = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.index, 1);
        assert!(tc.id.is_none());
        assert!(s.tool_args_line(9, "x").is_none());
        assert!(s.has_tool_calls());
    }

    #[test]
    fn keyed_tools_get_stable_indices() {
        let mut s = StreamState::new("m");
        assert_eq!(s.keyed_tool_index("tooluse_a"), (0, true));
        assert_eq!(s.keyed_tool_index("tooluse_b"), (1, true));
        assert_eq!(s.keyed_tool_index("tooluse_a"), (0, false));
    }
}
