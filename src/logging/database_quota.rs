use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::database::DatabaseLogger;
use super::time::to_db_string;
use crate::error::Result;
use crate::server::storage_traits::QuotaStore;

#[async_trait]
impl QuotaStore for DatabaseLogger {
    async fn quota_remaining(&self, user: &str) -> Result<Option<i64>> {
        let conn = self.connection.lock().await;
        let remaining = conn
            .query_row(
                "SELECT remaining FROM user_quotas WHERE user_key = ?1",
                [user],
                |row| row.get(0),
            )
            .optional()?;
        Ok(remaining)
    }

    async fn quota_deduct(&self, user: &str, amount: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        // 条件更新，余额不足时不扣
        let n = conn.execute(
            "UPDATE user_quotas SET remaining = remaining - ?2, updated_at = ?3
             WHERE user_key = ?1 AND remaining >= ?2",
            params![user, amount, to_db_string(&Utc::now())],
        )?;
        Ok(n > 0)
    }

    async fn quota_grant(&self, user: &str, amount: i64) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO user_quotas (user_key, remaining, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_key) DO UPDATE SET
                remaining = remaining + excluded.remaining,
                updated_at = excluded.updated_at",
            params![user, amount, to_db_string(&Utc::now())],
        )?;
        let remaining = conn.query_row(
            "SELECT remaining FROM user_quotas WHERE user_key = ?1",
            [user],
            |row| row.get(0),
        )?;
        Ok(remaining)
    }
}
