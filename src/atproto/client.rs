//! Directory client contract
//!
//! The reconcilers only talk to the network through [`DirectoryClient`].
//! [`super::XrpcClient`] is the production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use super::pagination::{Page, paginate};
use crate::error::AppError;

/// Authenticated session of the owner account
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Owner DID; the repository all blocks are written to
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
}

/// An entry of the owner's followers listing
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerView {
    pub did: String,
    pub handle: String,
    /// Present only when the listing includes profile counts
    pub following_count: Option<i64>,
}

/// Detailed profile of an account
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub did: String,
    pub handle: String,
    /// Number of accounts this profile follows, when the service reports it
    pub follows_count: Option<i64>,
}

/// A block record in some repository
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub uri: String,
    pub cid: String,
    /// The blocked account
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// Reference to a newly written record
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRecord {
    pub uri: String,
    pub cid: String,
}

/// Result of a delete call
///
/// Any status other than 2xx means the remote state is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub status: u16,
}

impl DeleteOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Remote directory operations used by the reconcilers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Log in and keep the session for subsequent calls
    async fn authenticate(&self, identifier: &str, password: &str) -> Result<Session, AppError>;

    /// Resolve a handle to its DID
    ///
    /// # Errors
    /// `NotFound` if the handle does not resolve
    async fn resolve_handle(&self, handle: &str) -> Result<String, AppError>;

    /// One page of the followers of `actor`
    async fn list_followers_page(
        &self,
        actor: &str,
        cursor: Option<String>,
    ) -> Result<Page<FollowerView>, AppError>;

    /// Detailed profile of `actor`
    async fn get_profile(&self, actor: &str) -> Result<Profile, AppError>;

    /// One page of the block records stored in `repo`
    async fn list_blocks_page(
        &self,
        repo: &str,
        cursor: Option<String>,
    ) -> Result<Page<BlockRecord>, AppError>;

    /// Write a block record for `subject` into `repo`
    async fn create_block(&self, repo: &str, subject: &str) -> Result<CreatedRecord, AppError>;

    /// Delete the block record `rkey` from `repo`
    async fn delete_block(&self, repo: &str, rkey: &str) -> Result<DeleteOutcome, AppError>;
}

/// Every follower of `actor`, fetched page by page
pub fn followers<'a>(
    client: &'a dyn DirectoryClient,
    actor: &'a str,
) -> BoxStream<'a, Result<FollowerView, AppError>> {
    paginate(move |cursor| client.list_followers_page(actor, cursor))
}

/// Every block record in `repo`, fetched page by page
pub fn blocks<'a>(
    client: &'a dyn DirectoryClient,
    repo: &'a str,
) -> BoxStream<'a, Result<BlockRecord, AppError>> {
    paginate(move |cursor| client.list_blocks_page(repo, cursor))
}

/// Following count of `did`; `None` when the profile does not report one
pub async fn following_count(
    client: &dyn DirectoryClient,
    did: &str,
) -> Result<Option<i64>, AppError> {
    Ok(client.get_profile(did).await?.follows_count)
}
