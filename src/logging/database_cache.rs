use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::database::DatabaseLogger;
use super::time::{column_time, to_db_string};
use super::types::CacheEntry;
use crate::error::Result;
use crate::server::storage_traits::CacheStore;

const CACHE_COLUMNS: &str = "id, cache_key, model, query_text, embedding, request, response,
    tokens_saved, hit_count, expires_at, created_at";

fn json_column<T: serde::de::DeserializeOwned>(raw: String, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let embedding = row
        .get::<_, Option<String>>(4)?
        .map(|raw| json_column::<Vec<f64>>(raw, 4))
        .transpose()?;
    Ok(CacheEntry {
        id: row.get(0)?,
        cache_key: row.get(1)?,
        model: row.get(2)?,
        query_text: row.get(3)?,
        embedding,
        request: json_column(row.get(5)?, 5)?,
        response: json_column(row.get(6)?, 6)?,
        tokens_saved: row.get(7)?,
        hit_count: row.get(8)?,
        expires_at: column_time(row.get(9)?, 9)?,
        created_at: column_time(row.get(10)?, 10)?,
    })
}

#[async_trait]
impl CacheStore for DatabaseLogger {
    async fn cache_get(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let conn = self.connection.lock().await;
        let sql = format!(
            "SELECT {} FROM request_cache WHERE cache_key = ?1 AND expires_at > ?2",
            CACHE_COLUMNS
        );
        let entry = conn
            .query_row(&sql, params![cache_key, to_db_string(&now)], row_to_entry)
            .optional()?;
        Ok(entry)
    }

    async fn cache_record_hit(&self, id: i64, tokens_saved: u32) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE request_cache SET hit_count = hit_count + 1, tokens_saved = tokens_saved + ?2
             WHERE id = ?1",
            params![id, tokens_saved],
        )?;
        Ok(())
    }

    async fn cache_semantic_candidates(
        &self,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>> {
        let conn = self.connection.lock().await;
        let sql = format!(
            "SELECT {} FROM request_cache
             WHERE model = ?1 AND expires_at > ?2 AND embedding IS NOT NULL
             ORDER BY created_at DESC",
            CACHE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![model, to_db_string(&now)], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn cache_put(&self, entry: &CacheEntry) -> Result<i64> {
        let embedding = entry.embedding.as_ref().map(serde_json::to_string).transpose()?;
        let request = serde_json::to_string(&entry.request)?;
        let response = serde_json::to_string(&entry.response)?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO request_cache (
                cache_key, model, query_text, embedding, request, response,
                tokens_saved, hit_count, expires_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.cache_key,
                entry.model,
                entry.query_text,
                embedding,
                request,
                response,
                entry.tokens_saved,
                entry.hit_count,
                to_db_string(&entry.expires_at),
                to_db_string(&entry.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn cache_purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connection.lock().await;
        let n = conn.execute(
            "DELETE FROM request_cache WHERE expires_at <= ?1",
            [to_db_string(&now)],
        )?;
        if n > 0 {
            tracing::info!("Purged {} expired cache entries", n);
        }
        Ok(n)
    }
}
