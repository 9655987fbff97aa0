pub mod database;
pub mod database_cache;
pub mod database_credentials;
pub mod database_logs;
pub mod database_pools;
pub mod database_quota;
pub mod time;
pub mod types;

pub use database::DatabaseLogger;
pub use types::{CacheEntry, LogFilter, PoolCredentialCounts, RequestLog};
