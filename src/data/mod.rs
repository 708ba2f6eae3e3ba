//! Data layer module
//!
//! Handles all local persistence and caching:
//! - SQLite database operations (followers, blocks, subscriptions)
//! - Handle cache (volatile)

mod database;
mod handle_cache;
mod models;

pub use database::Database;
pub use handle_cache::HandleCache;
pub use models::*;
