pub mod auth;
pub mod cache; // shared extraction cache
pub mod config_parser; // Clipgate config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod extractor; // TikTok page extraction
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod quota; // monthly quota tracking
pub mod rate_limit; // rate limiting
pub mod redis_client; // redis client
pub mod store; // shared counter/cache/stream store
mod testing;
pub mod usage; // usage ledger
