pub mod settings;

pub use settings::{
    CacheConfig, EmbeddingConfig, LoggingConfig, ProviderKind, QuotaConfig, RefreshConfig,
    RoutingConfig, ServerConfig, Settings, UpstreamConfig,
};
