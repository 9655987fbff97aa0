use rusqlite::{Connection, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLite 存储；凭证、号池、请求日志、响应缓存、额度共用一个连接
#[derive(Clone)]
pub struct DatabaseLogger {
    pub(crate) connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("Failed to create directory: {}", e)),
                    ));
                }
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        tracing::info!("Database initialized at: {}", database_path);

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                provider TEXT NOT NULL,
                description TEXT,
                strategy TEXT NOT NULL DEFAULT 'round_robin',
                health_check_interval_secs INTEGER NOT NULL DEFAULT 300,
                health_check_timeout_secs INTEGER NOT NULL DEFAULT 10,
                max_retries INTEGER NOT NULL DEFAULT 3,
                is_active INTEGER NOT NULL DEFAULT 1,
                total_requests INTEGER NOT NULL DEFAULT 0,
                total_errors INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pools_provider ON pools(provider, is_active);

            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pool_id INTEGER NOT NULL,
                provider TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                api_key TEXT,
                access_token TEXT,
                refresh_token TEXT,
                client_id TEXT,
                client_secret TEXT,
                region TEXT,
                account_name TEXT,
                account_email TEXT,
                profile TEXT,
                expires_at TEXT,
                weight INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                health_status TEXT NOT NULL DEFAULT 'unknown',
                last_error TEXT,
                last_used_at TEXT,
                total_requests INTEGER NOT NULL DEFAULT 0,
                total_errors INTEGER NOT NULL DEFAULT 0,
                rate_limit INTEGER NOT NULL DEFAULT 0,
                current_usage INTEGER NOT NULL DEFAULT 0,
                rate_limit_reset_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_pool ON credentials(pool_id);
            CREATE INDEX IF NOT EXISTS idx_credentials_expires ON credentials(expires_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_pool_email
                ON credentials(pool_id, account_email)
                WHERE deleted_at IS NULL AND account_email IS NOT NULL;

            CREATE TABLE IF NOT EXISTS pool_request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                credential_id INTEGER,
                pool_id INTEGER,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                protocol TEXT NOT NULL,
                stream INTEGER NOT NULL DEFAULT 0,
                cached INTEGER NOT NULL DEFAULT 0,
                status_code INTEGER NOT NULL,
                response_time_ms INTEGER NOT NULL,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_pool_request_logs_ts ON pool_request_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_pool_request_logs_pool ON pool_request_logs(pool_id);

            CREATE TABLE IF NOT EXISTS request_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cache_key TEXT NOT NULL UNIQUE,
                model TEXT NOT NULL,
                query_text TEXT NOT NULL,
                embedding TEXT,
                request TEXT NOT NULL,
                response TEXT NOT NULL,
                tokens_saved INTEGER NOT NULL DEFAULT 0,
                hit_count INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_request_cache_model ON request_cache(model, expires_at);

            CREATE TABLE IF NOT EXISTS user_quotas (
                user_key TEXT PRIMARY KEY,
                remaining INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );",
        )
    }
}
