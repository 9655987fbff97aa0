use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::database::DatabaseLogger;
use super::time::{column_time, to_db_string};
use super::types::PoolCredentialCounts;
use crate::config::ProviderKind;
use crate::error::{GatewayError, Result};
use crate::pool::Pool;
use crate::routing::SelectionStrategy;
use crate::server::storage_traits::PoolStore;

const POOL_COLUMNS: &str = "id, name, provider, description, strategy, health_check_interval_secs,
    health_check_timeout_secs, max_retries, is_active, total_requests, total_errors, created_at, updated_at";

fn row_to_pool(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pool> {
    let provider_s: String = row.get(2)?;
    let provider = ProviderKind::parse(&provider_s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(GatewayError::Config(format!("unknown provider '{}'", provider_s))),
        )
    })?;
    let strategy: Option<String> = row.get(4)?;
    Ok(Pool {
        id: row.get(0)?,
        name: row.get(1)?,
        provider,
        description: row.get(3)?,
        strategy: SelectionStrategy::from_db_value(strategy.as_deref()),
        health_check_interval_secs: row.get::<_, i64>(5)?.max(1) as u64,
        health_check_timeout_secs: row.get::<_, i64>(6)?.max(1) as u64,
        max_retries: row.get::<_, i64>(7)?.max(0) as u32,
        is_active: row.get::<_, i64>(8)? != 0,
        total_requests: row.get(9)?,
        total_errors: row.get(10)?,
        created_at: column_time(row.get(11)?, 11)?,
        updated_at: column_time(row.get(12)?, 12)?,
    })
}

impl DatabaseLogger {
    async fn bump_pool(&self, sql: &str, id: i64) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(sql, params![id, to_db_string(&Utc::now())])?;
        Ok(())
    }
}

#[async_trait]
impl PoolStore for DatabaseLogger {
    async fn create_pool(&self, pool: &Pool) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO pools (
                name, provider, description, strategy, health_check_interval_secs,
                health_check_timeout_secs, max_retries, is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                pool.name,
                pool.provider.as_str(),
                pool.description,
                pool.strategy.as_db_value(),
                pool.health_check_interval_secs as i64,
                pool.health_check_timeout_secs as i64,
                pool.max_retries as i64,
                pool.is_active as i64,
                to_db_string(&pool.created_at),
                to_db_string(&pool.updated_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!("Created pool {} ({}) for {}", id, pool.name, pool.provider);
        Ok(id)
    }

    async fn update_pool(&self, pool: &Pool) -> Result<()> {
        let conn = self.connection.lock().await;
        let n = conn.execute(
            "UPDATE pools SET name = ?2, provider = ?3, description = ?4, strategy = ?5,
                health_check_interval_secs = ?6, health_check_timeout_secs = ?7, max_retries = ?8,
                is_active = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                pool.id,
                pool.name,
                pool.provider.as_str(),
                pool.description,
                pool.strategy.as_db_value(),
                pool.health_check_interval_secs as i64,
                pool.health_check_timeout_secs as i64,
                pool.max_retries as i64,
                pool.is_active as i64,
                to_db_string(&Utc::now()),
            ],
        )?;
        if n == 0 {
            return Err(GatewayError::NotFound(format!("pool {}", pool.id)));
        }
        Ok(())
    }

    async fn get_pool(&self, id: i64) -> Result<Option<Pool>> {
        let conn = self.connection.lock().await;
        let sql = format!("SELECT {} FROM pools WHERE id = ?1", POOL_COLUMNS);
        Ok(conn.query_row(&sql, [id], row_to_pool).optional()?)
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let conn = self.connection.lock().await;
        let sql = format!("SELECT {} FROM pools ORDER BY id", POOL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_pool)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn find_active_pools(&self, provider: ProviderKind) -> Result<Vec<Pool>> {
        let conn = self.connection.lock().await;
        let sql = format!(
            "SELECT {} FROM pools WHERE provider = ?1 AND is_active = 1 ORDER BY id",
            POOL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([provider.as_str()], row_to_pool)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn set_pool_active(&self, id: i64, active: bool) -> Result<bool> {
        let conn = self.connection.lock().await;
        let n = conn.execute(
            "UPDATE pools SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active as i64, to_db_string(&Utc::now())],
        )?;
        Ok(n > 0)
    }

    async fn delete_pool(&self, id: i64) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let now = to_db_string(&Utc::now());
        // 号池删除时其下凭证一并软删除
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE credentials SET deleted_at = ?2, is_active = 0, updated_at = ?2
             WHERE pool_id = ?1 AND deleted_at IS NULL",
            params![id, now],
        )?;
        let n = tx.execute("DELETE FROM pools WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    async fn increment_pool_requests(&self, id: i64) -> Result<()> {
        self.bump_pool(
            "UPDATE pools SET total_requests = total_requests + 1, updated_at = ?2 WHERE id = ?1",
            id,
        )
        .await
    }

    async fn increment_pool_errors(&self, id: i64) -> Result<()> {
        self.bump_pool(
            "UPDATE pools SET total_errors = total_errors + 1, updated_at = ?2 WHERE id = ?1",
            id,
        )
        .await
    }

    async fn credential_counts(&self, pool_id: i64) -> Result<PoolCredentialCounts> {
        let conn = self.connection.lock().await;
        let counts = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN health_status = 'healthy' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN health_status = 'unhealthy' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN health_status NOT IN ('healthy', 'unhealthy') THEN 1 ELSE 0 END), 0)
             FROM credentials WHERE pool_id = ?1 AND deleted_at IS NULL",
            [pool_id],
            |row| {
                Ok(PoolCredentialCounts {
                    total: row.get(0)?,
                    active: row.get(1)?,
                    healthy: row.get(2)?,
                    unhealthy: row.get(3)?,
                    unknown: row.get(4)?,
                })
            },
        )?;
        Ok(counts)
    }
}
