use async_trait::async_trait;
use rusqlite::params_from_iter;
use rusqlite::types::Value;

use super::database::DatabaseLogger;
use super::time::{column_time, to_db_string};
use super::types::{LogFilter, RequestLog};
use crate::error::Result;
use crate::server::storage_traits::RequestLogStore;

const DEFAULT_LOG_LIMIT: u32 = 100;
const MAX_LOG_LIMIT: u32 = 1000;

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestLog> {
    Ok(RequestLog {
        id: Some(row.get(0)?),
        timestamp: column_time(row.get(1)?, 1)?,
        credential_id: row.get(2)?,
        pool_id: row.get(3)?,
        provider: row.get(4)?,
        model: row.get(5)?,
        method: row.get(6)?,
        path: row.get(7)?,
        protocol: row.get(8)?,
        stream: row.get::<_, i64>(9)? != 0,
        cached: row.get::<_, i64>(10)? != 0,
        status_code: row.get(11)?,
        response_time_ms: row.get(12)?,
        prompt_tokens: row.get(13)?,
        completion_tokens: row.get(14)?,
        total_tokens: row.get(15)?,
        error_message: row.get(16)?,
    })
}

#[async_trait]
impl RequestLogStore for DatabaseLogger {
    async fn log_attempt(&self, log: &RequestLog) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO pool_request_logs (
                timestamp, credential_id, pool_id, provider, model, method, path, protocol,
                stream, cached, status_code, response_time_ms, prompt_tokens,
                completion_tokens, total_tokens, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            rusqlite::params![
                to_db_string(&log.timestamp),
                log.credential_id,
                log.pool_id,
                log.provider,
                log.model,
                log.method,
                log.path,
                log.protocol,
                log.stream as i64,
                log.cached as i64,
                log.status_code,
                log.response_time_ms,
                log.prompt_tokens,
                log.completion_tokens,
                log.total_tokens,
                log.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn recent_logs(&self, filter: &LogFilter) -> Result<Vec<RequestLog>> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(pid) = filter.pool_id {
            args.push(pid.into());
            clauses.push(format!("pool_id = ?{}", args.len()));
        }
        if let Some(cid) = filter.credential_id {
            args.push(cid.into());
            clauses.push(format!("credential_id = ?{}", args.len()));
        }
        if filter.errors_only {
            clauses.push("status_code >= 400".to_string());
        }
        let limit = match filter.limit {
            0 => DEFAULT_LOG_LIMIT,
            n => n.min(MAX_LOG_LIMIT),
        };
        args.push(i64::from(limit).into());
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, timestamp, credential_id, pool_id, provider, model, method, path, protocol,
                    stream, cached, status_code, response_time_ms, prompt_tokens,
                    completion_tokens, total_tokens, error_message
             FROM pool_request_logs {}
             ORDER BY timestamp DESC, id DESC
             LIMIT ?{}",
            where_sql,
            args.len()
        );

        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_log)?;
        let mut logs = Vec::new();
        for r in rows {
            logs.push(r?);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::database::tests::temp_logger;
    use chrono::{Duration, Utc};

    fn log(pool_id: Option<i64>, credential_id: Option<i64>, status: u16) -> RequestLog {
        RequestLog {
            id: None,
            timestamp: Utc::now(),
            credential_id,
            pool_id,
            provider: "openai".into(),
            model: "gpt-4o".into(),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            protocol: "openai".into(),
            stream: false,
            cached: false,
            status_code: status,
            response_time_ms: 12,
            prompt_tokens: Some(3),
            completion_tokens: Some(4),
            total_tokens: Some(7),
            error_message: (status >= 400).then(|| "failed".to_string()),
        }
    }

    #[tokio::test]
    async fn logs_are_listed_newest_first_with_filters() {
        let (_dir, db) = temp_logger().await;
        let mut old = log(Some(1), Some(10), 200);
        old.timestamp = Utc::now() - Duration::minutes(5);
        db.log_attempt(&old).await.unwrap();
        db.log_attempt(&log(Some(1), Some(11), 502)).await.unwrap();
        db.log_attempt(&log(None, None, 503)).await.unwrap();

        let all = db.recent_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp >= all[2].timestamp);
        assert_eq!(all[2].credential_id, Some(10));

        let pool = db
            .recent_logs(&LogFilter { pool_id: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(pool.len(), 2);

        let errors = db
            .recent_logs(&LogFilter { pool_id: Some(1), errors_only: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status_code, 502);
        assert_eq!(errors[0].error_message.as_deref(), Some("failed"));

        let one = db
            .recent_logs(&LogFilter { limit: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].pool_id, None);
    }
}
