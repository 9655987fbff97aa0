pub mod handlers;
pub(crate) mod model_parser;
pub mod storage_traits;
pub(crate) mod util;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{Method, header};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::{Embedder, HttpEmbedder, ResponseCache};
use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::logging::DatabaseLogger;
use crate::proxy::{ProxyService, Recorder};
use crate::refresh::{HttpProbe, OidcTokenRefresher, RefreshEngine};
use crate::routing::SelectorState;
use crate::server::storage_traits::{CredentialStore, PoolStore, QuotaStore, RequestLogStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub credentials: Arc<dyn CredentialStore>,
    pub pools: Arc<dyn PoolStore>,
    pub logs: Arc<dyn RequestLogStore>,
    pub quota: Arc<dyn QuotaStore>,
    pub cache: Arc<ResponseCache>,
    pub proxy: Arc<ProxyService>,
    pub refresh: Arc<RefreshEngine>,
}

impl AppState {
    /// 所有存储都落在同一个 SQLite 上
    pub fn new(config: Settings, db: Arc<DatabaseLogger>) -> AppResult<Self> {
        let embedder: Option<Arc<dyn Embedder>> = if config.embedding.enabled {
            Some(Arc::new(HttpEmbedder::new(
                &config.embedding.url,
                Duration::from_secs(config.embedding.timeout_secs.max(1)),
            )?))
        } else {
            None
        };
        let cache = Arc::new(ResponseCache::new(db.clone(), embedder, config.cache.clone()));

        let recorder = Recorder {
            credentials: db.clone(),
            pools: db.clone(),
            logs: db.clone(),
            quota: db.clone(),
            quota_enabled: config.quota.enabled,
        };
        let proxy = Arc::new(ProxyService::new(
            recorder,
            cache.clone(),
            Arc::new(SelectorState::new()),
            config.upstream.clone(),
            config.routing.clone(),
        )?);

        let refresh = Arc::new(RefreshEngine::new(
            db.clone(),
            db.clone(),
            Arc::new(OidcTokenRefresher::new(config.refresh.clone())),
            Arc::new(HttpProbe::new(config.upstream.clone())),
            config.refresh.clone(),
        ));

        Ok(Self {
            config,
            credentials: db.clone(),
            pools: db.clone(),
            logs: db.clone(),
            quota: db,
            cache,
            proxy,
            refresh,
        })
    }
}

/// 路由 + 后台任务；`shutdown` 取消并等待后台任务退出
pub struct Gateway {
    pub router: Router,
    pub state: Arc<AppState>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    // 管理端由独立前端调用，放开来源
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-goog-api-key"),
            header::HeaderName::from_static("anthropic-version"),
        ])
        .allow_origin(Any);

    handlers::routes()
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn create_app(config: Settings) -> AppResult<Gateway> {
    let db = Arc::new(DatabaseLogger::new(&config.logging.database_path).await?);
    tracing::info!("Using SQLite database at {}", config.logging.database_path);

    if config.server.admin_token.as_deref().is_none_or(str::is_empty) {
        tracing::warn!("server.admin_token is not set; admin endpoints are unauthenticated");
    }

    let state = Arc::new(AppState::new(config, db)?);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if state.config.refresh.enabled {
        tasks.push(state.refresh.spawn(cancel.child_token()));
    } else {
        tracing::info!("Credential refresh engine disabled");
    }
    if state.cache.enabled() {
        tasks.push(state.cache.spawn_sweeper(cancel.child_token()));
    }

    Ok(Gateway {
        router: router(state.clone()),
        state,
        cancel,
        tasks,
    })
}
