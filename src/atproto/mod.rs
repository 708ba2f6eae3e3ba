//! AT Protocol directory access
//!
//! The trait every reconciler talks to, the XRPC implementation,
//! cursor pagination, client-side pacing and record URI parsing.

mod client;
mod pagination;
mod rate_limit;
mod record_key;
mod xrpc;

#[cfg(test)]
pub use client::MockDirectoryClient;
pub use client::{
    BlockRecord, CreatedRecord, DeleteOutcome, DirectoryClient, FollowerView, Profile, Session,
    blocks, followers, following_count,
};
pub use pagination::{Page, collect_all, paginate};
pub use rate_limit::RateLimiter;
pub use record_key::{RecordUri, parse_record_key};
pub use xrpc::XrpcClient;

/// Collection all block records live in
pub const BLOCK_COLLECTION: &str = "app.bsky.graph.block";
