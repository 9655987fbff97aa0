use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub upstream: UpstreamConfig,
    pub routing: RoutingConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub refresh: RefreshConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Gemini,
    /// Kiro 账号池背后的 CodeWhisperer 接口，只接受 OAuth 凭据
    Kiro,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Kiro => "kiro",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            "kiro" | "codewhisperer" => Some(Self::Kiro),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Kiro => "https://q.us-east-1.amazonaws.com",
        }
    }

    pub const ALL: [ProviderKind; 4] = [Self::OpenAI, Self::Anthropic, Self::Gemini, Self::Kiro];

    /// 导入的外部账号（AWS OIDC 令牌）只对 Kiro 有效，Kiro 也不认 API key
    pub fn requires_oauth(&self) -> bool {
        matches!(self, Self::Kiro)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 管理接口的 Bearer 口令；为空时不校验
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub database_path: String,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub base_urls: BTreeMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            stream_idle_timeout_secs: 120,
            base_urls: BTreeMap::new(),
        }
    }
}

impl UpstreamConfig {
    pub fn base_url(&self, kind: ProviderKind) -> String {
        self.base_urls
            .get(kind.as_str())
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| kind.default_base_url().to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// 模型名前缀 -> 供应商
    pub model_prefixes: BTreeMap<String, ProviderKind>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut model_prefixes = BTreeMap::new();
        for p in ["gpt-", "o1", "o3", "o4", "chatgpt"] {
            model_prefixes.insert(p.to_string(), ProviderKind::OpenAI);
        }
        model_prefixes.insert("claude".to_string(), ProviderKind::Anthropic);
        model_prefixes.insert("gemini".to_string(), ProviderKind::Gemini);
        Self { model_prefixes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub semantic_match: bool,
    pub threshold: f64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 24 * 3600,
            semantic_match: true,
            threshold: 0.85,
            sweep_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8765".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lookahead_secs: i64,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    /// `{region}` 会被替换为凭据所属区域
    pub token_endpoint: String,
    pub default_region: String,
    pub health_probe: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            lookahead_secs: 30 * 60,
            request_timeout_secs: 60,
            concurrency: 8,
            token_endpoint: "https://oidc.{region}.amazonaws.com/token".to_string(),
            default_region: "us-east-1".to_string(),
            health_probe: true,
        }
    }
}

impl RefreshConfig {
    pub fn token_url(&self, region: Option<&str>) -> String {
        let region = region
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(&self.default_region);
        self.token_endpoint.replace("{region}", region)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
}

impl Settings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let settings = Self::from_toml(&config_content)?;
        tracing::info!("Loaded configuration from {}", config_path);
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn find_config_file() -> Result<String, Box<dyn std::error::Error>> {
        if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
            if Path::new(&path).exists() {
                return Ok(path);
            }
            return Err(format!("GATEWAY_CONFIG points to missing file: {}", path).into());
        }

        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err("Configuration file not found. Please create custom-config.toml or config.toml".into())
    }
}
