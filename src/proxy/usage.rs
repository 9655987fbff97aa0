//! 额度预检用的粗略 token 估算

use crate::protocol::canonical::{ChatRequest, Usage};

/// 约 3 个字符一个 token；每条消息另计 10 个字符，每个工具 150 个字符
pub fn estimate_input_tokens(req: &ChatRequest) -> i64 {
    let mut chars: usize = req
        .messages
        .iter()
        .map(|m| m.content.as_deref().map_or(0, str::len) + 10)
        .sum();
    chars += req.tools.as_ref().map_or(0, |t| t.len() * 150);
    ((chars / 3) as i64).max(10)
}

/// 有 max_tokens 用它，否则取输入的一半并限制在 [100, 2000]
pub fn estimate_output_tokens(req: &ChatRequest, input_tokens: i64) -> i64 {
    match req.max_tokens {
        Some(n) if n > 0 => n as i64,
        _ => (input_tokens / 2).clamp(100, 2000),
    }
}

pub fn estimate_total_tokens(req: &ChatRequest) -> i64 {
    let input = estimate_input_tokens(req);
    input + estimate_output_tokens(req, input)
}

/// 上游流里没有 usage 时的兜底
pub fn fallback_stream_usage(req: &ChatRequest) -> Usage {
    Usage::new(100 * req.messages.len() as u32, 100)
}
