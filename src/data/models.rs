//! Data models
//!
//! Rust structs representing the four local collections.
//! Every row is keyed by the account's DID; handles are display-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

// =============================================================================
// Enums
// =============================================================================

/// Whether a follower is currently blocked by the spam pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i64)]
pub enum BlockStatus {
    NotBlocked = 0,
    Blocked = 1,
}

/// Provenance tag on a user block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BlockReason {
    /// Blocked by a human through a native client
    Manual,
    /// Follow count exceeded the configured limit
    Spam,
    /// Mirrored from a subscribed account's block list
    Subscription,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Spam => "spam",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockReason {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "spam" => Ok(Self::Spam),
            "subscription" => Ok(Self::Subscription),
            other => Err(AppError::Validation(format!("unknown block reason: {other}"))),
        }
    }
}

// =============================================================================
// Collections
// =============================================================================

/// The local collections, used wherever a query spans tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Followers,
    UserBlocks,
    SubscriptionBlocks,
    Subscriptions,
}

impl Collection {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Followers => "followers",
            Self::UserBlocks => "blocks",
            Self::SubscriptionBlocks => "subscription_blocks",
            Self::Subscriptions => "subscriptions",
        }
    }

    /// Whether rows carry a `reason` column
    pub fn has_reason(&self) -> bool {
        matches!(self, Self::UserBlocks | Self::SubscriptionBlocks)
    }
}

// =============================================================================
// Followers
// =============================================================================

/// An account following the owner
///
/// Rows are never deleted, so an unfollow keeps the last observation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub did: String,
    pub handle: String,
    pub following_count: i64,
    pub block_status: BlockStatus,
    #[sqlx(rename = "date_last_updated")]
    pub last_updated: DateTime<Utc>,
}

impl Follower {
    /// Baseline row for a follower seen for the first time
    pub fn first_seen(did: &str, handle: &str) -> Self {
        Self {
            did: did.to_string(),
            handle: handle.to_string(),
            following_count: 0,
            block_status: BlockStatus::NotBlocked,
            last_updated: Utc::now(),
        }
    }
}

// =============================================================================
// User blocks
// =============================================================================

/// A block the owner's repository holds (or is about to hold)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserBlock {
    pub did: String,
    pub handle: String,
    /// Record key of the `app.bsky.graph.block` record
    #[sqlx(rename = "r_key")]
    pub rkey: Option<String>,
    pub reason: BlockReason,
    pub date_blocked: DateTime<Utc>,
    #[sqlx(rename = "date_last_updated")]
    pub last_updated: DateTime<Utc>,
}

// =============================================================================
// Subscription blocks
// =============================================================================

/// One (subscriber, blocked account) pair from a subscribed block list
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionBlock {
    /// The blocked account
    pub did: String,
    /// The subscribed account whose list contains `did`
    pub subscribed_did: String,
    pub reason: BlockReason,
    #[sqlx(rename = "date_last_updated")]
    pub last_updated: DateTime<Utc>,
}

impl SubscriptionBlock {
    pub fn new(did: &str, subscribed_did: &str) -> Self {
        Self {
            did: did.to_string(),
            subscribed_did: subscribed_did.to_string(),
            reason: BlockReason::Subscription,
            last_updated: Utc::now(),
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// An account whose block list is mirrored
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub did: String,
    pub handle: String,
    pub block_count: i64,
    pub date_added: DateTime<Utc>,
    #[sqlx(rename = "date_last_updated")]
    pub last_updated: DateTime<Utc>,
}
