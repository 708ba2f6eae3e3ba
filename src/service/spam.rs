//! Spam reconciler
//!
//! Blocks followers whose following count is above the configured limit.
//! Blocking is one-directional here; a follower whose count drops is marked
//! NOT_BLOCKED but its block record stays until repository sync removes it.

use chrono::Utc;
use std::sync::Arc;

use super::{PassReport, skip_item};
use crate::atproto::{DirectoryClient, FollowerView, collect_all, followers, following_count, parse_record_key};
use crate::data::{BlockReason, BlockStatus, Collection, Database, Follower, HandleCache, UserBlock};
use crate::error::AppError;
use crate::metrics::BLOCKS_CREATED_TOTAL;

const PASS: &str = "spam";

/// Spam reconciler
pub struct SpamReconciler {
    db: Arc<Database>,
    client: Arc<dyn DirectoryClient>,
    handles: Arc<HandleCache>,
}

impl SpamReconciler {
    /// Create new spam reconciler
    pub fn new(db: Arc<Database>, client: Arc<dyn DirectoryClient>, handles: Arc<HandleCache>) -> Self {
        Self { db, client, handles }
    }

    /// Run one pass over every follower of `owner`
    ///
    /// # Arguments
    /// * `owner` - DID of the authenticated account
    /// * `threshold` - Followers following strictly more accounts are blocked
    ///
    /// # Errors
    /// Fails if the followers listing cannot be fetched, or on an error that
    /// would fail every remaining follower (session, rate limit, database).
    pub async fn run(&self, owner: &str, threshold: i64) -> Result<PassReport, AppError> {
        let followers = collect_all(followers(self.client.as_ref(), owner)).await?;
        tracing::info!(followers = followers.len(), threshold, "Spam pass started");

        let mut report = PassReport::default();
        for view in &followers {
            if let Err(error) = self.reconcile_follower(owner, threshold, view, &mut report).await {
                skip_item(PASS, &view.did, error, &mut report)?;
            }
        }

        tracing::info!(%report, "Spam pass finished");
        Ok(report)
    }

    async fn reconcile_follower(
        &self,
        owner: &str,
        threshold: i64,
        view: &FollowerView,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let mut follower = match self.db.get_follower(&view.did).await? {
            Some(follower) => follower,
            None => {
                let follower = Follower::first_seen(&view.did, &view.handle);
                self.db.insert_follower(&follower).await?;
                report.rows_inserted += 1;
                tracing::debug!(did = %view.did, handle = %view.handle, "New follower");
                follower
            }
        };
        self.handles.insert(&view.did, &view.handle).await;

        let count = self.following_count(view).await?;

        let block_status = if count > threshold {
            if self.db.exists(Collection::UserBlocks, &view.did).await? {
                tracing::debug!(did = %view.did, count, "Already blocked");
            } else {
                self.block(owner, view, count, report).await?;
            }
            BlockStatus::Blocked
        } else {
            BlockStatus::NotBlocked
        };

        if follower.handle != view.handle {
            tracing::debug!(did = %view.did, old = %follower.handle, new = %view.handle, "Follower handle changed");
            follower.handle = view.handle.clone();
        }
        follower.following_count = count;
        follower.block_status = block_status;
        follower.last_updated = Utc::now();
        self.db.update_follower(&follower).await?;
        report.rows_updated += 1;

        Ok(())
    }

    /// Following count of a follower; unknown counts are treated as 0
    async fn following_count(&self, view: &FollowerView) -> Result<i64, AppError> {
        if let Some(count) = view.following_count {
            return Ok(count);
        }

        match following_count(self.client.as_ref(), &view.did).await {
            Ok(Some(count)) => Ok(count),
            Ok(None) => {
                tracing::warn!(did = %view.did, "Profile has no following count, using 0");
                Ok(0)
            }
            Err(error) if error.aborts_pass() => Err(error),
            Err(error) => {
                tracing::warn!(did = %view.did, error = %error, "Failed to fetch following count, using 0");
                Ok(0)
            }
        }
    }

    async fn block(
        &self,
        owner: &str,
        view: &FollowerView,
        count: i64,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let created = self.client.create_block(owner, &view.did).await?;
        report.blocks_created += 1;
        BLOCKS_CREATED_TOTAL.with_label_values(&[BlockReason::Spam.as_str()]).inc();

        let rkey = match parse_record_key(&created.uri) {
            Ok(rkey) => Some(rkey),
            Err(error) => {
                tracing::error!(did = %view.did, uri = %created.uri, error = %error, "Created block has a malformed URI");
                None
            }
        };

        let now = Utc::now();
        self.db
            .insert_user_block(&UserBlock {
                did: view.did.clone(),
                handle: view.handle.clone(),
                rkey,
                reason: BlockReason::Spam,
                date_blocked: now,
                last_updated: now,
            })
            .await?;
        report.rows_inserted += 1;

        tracing::info!(did = %view.did, handle = %view.handle, count, "Blocked follower");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fake::{FakeDirectory, OWNER};
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        directory: Arc<FakeDirectory>,
        reconciler: SpamReconciler,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let directory = Arc::new(FakeDirectory::new());
        let reconciler = SpamReconciler::new(
            db.clone(),
            directory.clone(),
            Arc::new(HandleCache::default()),
        );
        Fixture {
            db,
            directory,
            reconciler,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn blocks_follower_above_threshold() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:f1", 500);

        let report = f.reconciler.run(OWNER, 400).await.unwrap();

        assert_eq!(report.blocks_created, 1);
        assert_eq!(
            f.directory.creates(),
            vec![(OWNER.to_string(), "did:plc:f1".to_string())]
        );

        let block = f.db.get_user_block("did:plc:f1").await.unwrap().unwrap();
        assert_eq!(block.reason, BlockReason::Spam);
        assert_eq!(block.rkey.as_deref(), Some("rk1"));

        let follower = f.db.get_follower("did:plc:f1").await.unwrap().unwrap();
        assert_eq!(follower.block_status, BlockStatus::Blocked);
        assert_eq!(follower.following_count, 500);
    }

    #[tokio::test]
    async fn threshold_is_strictly_greater_than() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:equal", 400);
        f.directory.add_follower("did:plc:above", 401);

        f.reconciler.run(OWNER, 400).await.unwrap();

        let equal = f.db.get_follower("did:plc:equal").await.unwrap().unwrap();
        assert_eq!(equal.block_status, BlockStatus::NotBlocked);
        assert_eq!(equal.following_count, 400);
        assert!(f.db.get_user_block("did:plc:equal").await.unwrap().is_none());

        let above = f.db.get_follower("did:plc:above").await.unwrap().unwrap();
        assert_eq!(above.block_status, BlockStatus::Blocked);
        assert_eq!(f.directory.creates().len(), 1);
    }

    #[tokio::test]
    async fn second_run_makes_no_new_blocks() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:f1", 500);
        f.directory.add_follower("did:plc:f2", 10);

        f.reconciler.run(OWNER, 400).await.unwrap();
        f.directory.clear_calls();

        let report = f.reconciler.run(OWNER, 400).await.unwrap();
        assert!(report.is_noop(), "{report}");
        assert!(f.directory.creates().is_empty());
        assert_eq!(report.rows_updated, 2);
    }

    #[tokio::test]
    async fn profile_failure_counts_as_zero() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:broken", 9000);
        f.directory.fail_profile("did:plc:broken");
        f.directory.add_follower("did:plc:spam", 9000);

        let report = f.reconciler.run(OWNER, 400).await.unwrap();

        let broken = f.db.get_follower("did:plc:broken").await.unwrap().unwrap();
        assert_eq!(broken.following_count, 0);
        assert_eq!(broken.block_status, BlockStatus::NotBlocked);
        // The next follower is still processed
        assert_eq!(report.blocks_created, 1);
        assert!(f.db.get_user_block("did:plc:spam").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropping_below_threshold_keeps_block() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:f1", 500);
        f.reconciler.run(OWNER, 400).await.unwrap();

        f.directory.set_follows("did:plc:f1", 100);
        f.reconciler.run(OWNER, 400).await.unwrap();

        let follower = f.db.get_follower("did:plc:f1").await.unwrap().unwrap();
        assert_eq!(follower.block_status, BlockStatus::NotBlocked);
        assert_eq!(follower.following_count, 100);
        assert!(f.db.get_user_block("did:plc:f1").await.unwrap().is_some());
        assert!(f.directory.deletes().is_empty());
    }

    #[tokio::test]
    async fn existing_block_of_other_reason_is_left_alone() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:f1", 500);
        let now = Utc::now();
        f.db.insert_user_block(&UserBlock {
            did: "did:plc:f1".to_string(),
            handle: "f1.test".to_string(),
            rkey: Some("manual1".to_string()),
            reason: BlockReason::Manual,
            date_blocked: now,
            last_updated: now,
        })
        .await
        .unwrap();

        f.reconciler.run(OWNER, 400).await.unwrap();

        assert!(f.directory.creates().is_empty());
        let block = f.db.get_user_block("did:plc:f1").await.unwrap().unwrap();
        assert_eq!(block.reason, BlockReason::Manual);
        let follower = f.db.get_follower("did:plc:f1").await.unwrap().unwrap();
        assert_eq!(follower.block_status, BlockStatus::Blocked);
    }

    #[tokio::test]
    async fn malformed_uri_is_recorded_without_key() {
        let f = fixture().await;
        f.directory.add_follower("did:plc:f1", 500);
        f.directory.return_malformed_uris();

        f.reconciler.run(OWNER, 400).await.unwrap();
        f.reconciler.run(OWNER, 400).await.unwrap();

        let block = f.db.get_user_block("did:plc:f1").await.unwrap().unwrap();
        assert!(block.rkey.is_none());
        assert_eq!(f.directory.creates().len(), 1);
    }

    #[tokio::test]
    async fn listing_failure_fails_the_pass() {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let mut client = crate::atproto::MockDirectoryClient::new();
        client
            .expect_list_followers_page()
            .returning(|_, _| Err(AppError::Unauthorized));

        let reconciler = SpamReconciler::new(db, Arc::new(client), Arc::new(HandleCache::default()));
        let error = reconciler.run(OWNER, 400).await.unwrap_err();
        assert!(matches!(error, AppError::Unauthorized));
    }
}
