use crate::error::GatewayError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 数据库中的时间统一为定宽 RFC3339（毫秒, `Z`），字符串比较即时间比较
pub fn to_db_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn to_db_opt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(to_db_string)
}

/// 解析数据库时间字符串：
/// - 优先 RFC3339 / ISO-8601
/// - 兼容手工写入的 `YYYY-MM-DD HH:mm:ss`（按 UTC 解释）
pub fn parse_db_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .map_err(|e| GatewayError::TimeParse(format!("{}: {}", s, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// rusqlite 行映射里使用：解析失败转成 FromSqlConversionFailure
pub fn column_time(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_db_string(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn column_time_opt(raw: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| column_time(s, idx)).transpose()
}

/// 导出账号里的毫秒时间戳
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}
