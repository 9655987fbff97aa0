use crate::config::{ProviderKind, RoutingConfig};
use crate::error::{GatewayError, Result};

/// 解析模型名称，提取供应商前缀和实际模型名称
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModel {
    pub provider: Option<ProviderKind>,
    pub model_name: String,
}

impl ParsedModel {
    /// 示例：
    /// - "anthropic/claude-3-5-sonnet" -> provider Anthropic, model "claude-3-5-sonnet"
    /// - "meta-llama/Llama-3" -> 前缀不是已知供应商，整体作为模型名
    pub fn parse(model: &str) -> Self {
        if let Some((prefix, rest)) = model.split_once('/')
            && let Some(kind) = ProviderKind::parse(prefix)
            && !rest.is_empty()
        {
            return Self {
                provider: Some(kind),
                model_name: rest.to_string(),
            };
        }
        Self {
            provider: None,
            model_name: model.to_string(),
        }
    }

    /// 显式前缀优先，否则按路由表做最长前缀匹配
    pub fn resolve_provider(&self, routing: &RoutingConfig) -> Result<ProviderKind> {
        if let Some(kind) = self.provider {
            return Ok(kind);
        }
        let lower = self.model_name.to_ascii_lowercase();
        routing
            .model_prefixes
            .iter()
            .filter(|(prefix, _)| lower.starts_with(&prefix.to_ascii_lowercase()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                GatewayError::Parse(format!("no provider is configured for model '{}'", self.model_name))
            })
    }

    /// 获取实际应该传递给上游 API 的模型名称
    pub fn get_upstream_model_name(&self) -> &str {
        &self.model_name
    }
}
