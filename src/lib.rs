pub mod cache;
pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod providers;
pub mod proxy;
pub mod refresh;
pub mod routing;
pub mod server;
