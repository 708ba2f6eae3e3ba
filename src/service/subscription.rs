//! Subscription reconciler
//!
//! Maintains `subscription_blocks` as a materialized view of the block lists
//! of every subscribed account. After a pass, a (subscriber, subject) row
//! exists if and only if the subscriber currently lists the subject.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use super::{PassReport, skip_item};
use crate::atproto::{DirectoryClient, blocks, collect_all};
use crate::data::{Database, SubscriptionBlock};
use crate::error::AppError;
use crate::metrics::SUBSCRIPTION_BLOCKS_TOTAL;

const PASS: &str = "subscription";

/// Subscription reconciler
pub struct SubscriptionReconciler {
    db: Arc<Database>,
    client: Arc<dyn DirectoryClient>,
}

impl SubscriptionReconciler {
    /// Create new subscription reconciler
    pub fn new(db: Arc<Database>, client: Arc<dyn DirectoryClient>) -> Self {
        Self { db, client }
    }

    /// Mirror the block lists of `handles`
    ///
    /// A subscription that cannot be resolved or listed keeps its rows from
    /// the previous pass. Rows of accounts that are no longer subscribed
    /// are removed.
    pub async fn run(&self, handles: &[String]) -> Result<PassReport, AppError> {
        tracing::info!(subscriptions = handles.len(), "Subscription pass started");

        let mut report = PassReport::default();
        let known = self.db.get_all_subscriptions().await?;
        // Subscribers whose rows survive this pass
        let mut retained: HashSet<String> = HashSet::new();

        for handle in handles {
            let did = match self.client.resolve_handle(handle).await {
                Ok(did) => did,
                Err(error) => {
                    if let Some(previous) = known.iter().find(|s| s.handle == *handle) {
                        retained.insert(previous.did.clone());
                    }
                    skip_item(PASS, handle, error, &mut report)?;
                    continue;
                }
            };

            if !retained.insert(did.clone()) {
                tracing::debug!(%handle, %did, "Subscription listed twice, skipping");
                continue;
            }

            if let Err(error) = self.sync_subscription(handle, &did, &mut report).await {
                skip_item(PASS, &did, error, &mut report)?;
            }
        }

        self.drop_unsubscribed(&retained, &mut report).await?;

        tracing::info!(%report, "Subscription pass finished");
        Ok(report)
    }

    /// Bring one subscriber's rows in line with its current block list
    async fn sync_subscription(
        &self,
        handle: &str,
        subscriber: &str,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let remote: HashSet<String> = collect_all(blocks(self.client.as_ref(), subscriber))
            .await?
            .into_iter()
            .map(|record| record.subject)
            .collect();
        let cached: HashSet<String> = self
            .db
            .subscription_blocks_for(subscriber)
            .await?
            .into_iter()
            .map(|row| row.did)
            .collect();

        let mut added: Vec<&String> = remote.difference(&cached).collect();
        added.sort();
        for subject in added {
            match self
                .db
                .insert_subscription_block(&SubscriptionBlock::new(subject, subscriber))
                .await
            {
                Ok(()) => {
                    report.rows_inserted += 1;
                    SUBSCRIPTION_BLOCKS_TOTAL.with_label_values(&["insert"]).inc();
                    tracing::debug!(%subscriber, %subject, "Subscription block added");
                }
                Err(error) => skip_item(PASS, subject, error, report)?,
            }
        }

        let mut stale: Vec<&String> = cached.difference(&remote).collect();
        stale.sort();
        for subject in stale {
            if self.db.delete_subscription_block(subscriber, subject).await? {
                report.rows_deleted += 1;
                SUBSCRIPTION_BLOCKS_TOTAL.with_label_values(&["remove"]).inc();
                tracing::debug!(%subscriber, %subject, "Subscription block removed");
            }
        }

        self.db
            .upsert_subscription(subscriber, handle, remote.len() as i64, Utc::now())
            .await?;

        tracing::info!(%handle, did = %subscriber, blocks = remote.len(), "Subscription synced");
        Ok(())
    }

    async fn drop_unsubscribed(
        &self,
        retained: &HashSet<String>,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        for row in self.db.get_all_subscription_blocks().await? {
            if retained.contains(&row.subscribed_did) {
                continue;
            }
            if self
                .db
                .delete_subscription_block(&row.subscribed_did, &row.did)
                .await?
            {
                report.rows_deleted += 1;
                SUBSCRIPTION_BLOCKS_TOTAL.with_label_values(&["remove"]).inc();
            }
        }

        for subscription in self.db.get_all_subscriptions().await? {
            if !retained.contains(&subscription.did) && self.db.delete_subscription(&subscription.did).await? {
                tracing::info!(handle = %subscription.handle, did = %subscription.did, "Unsubscribed");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fake::FakeDirectory;
    use tempfile::TempDir;

    const S1: &str = "did:plc:s1";
    const S2: &str = "did:plc:s2";

    async fn setup() -> (Arc<Database>, Arc<FakeDirectory>, SubscriptionReconciler, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let directory = Arc::new(FakeDirectory::new());
        directory.add_account("s1.test", S1);
        directory.add_account("s2.test", S2);
        let reconciler = SubscriptionReconciler::new(db.clone(), directory.clone());
        (db, directory, reconciler, temp_dir)
    }

    fn handles() -> Vec<String> {
        vec!["s1.test".to_string(), "s2.test".to_string()]
    }

    async fn subjects_of(db: &Database, subscriber: &str) -> Vec<String> {
        let mut subjects: Vec<String> = db
            .subscription_blocks_for(subscriber)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.did)
            .collect();
        subjects.sort();
        subjects
    }

    #[tokio::test]
    async fn mirrors_each_subscriber_block_list() {
        let (db, directory, reconciler, _temp_dir) = setup().await;
        for subject in ["did:plc:a", "did:plc:b", "did:plc:c"] {
            directory.seed_block(S1, subject);
        }
        directory.seed_block(S2, "did:plc:b");

        let report = reconciler.run(&handles()).await.unwrap();

        assert_eq!(report.rows_inserted, 4);
        assert_eq!(subjects_of(&db, S1).await, directory.blocked_subjects(S1));
        assert_eq!(subjects_of(&db, S2).await, directory.blocked_subjects(S2));

        let subscription = db.get_subscription(S1).await.unwrap().unwrap();
        assert_eq!(subscription.handle, "s1.test");
        assert_eq!(subscription.block_count, 3);
    }

    #[tokio::test]
    async fn removes_rows_no_longer_listed() {
        let (db, directory, reconciler, _temp_dir) = setup().await;
        directory.seed_block(S1, "did:plc:x");
        directory.seed_block(S1, "did:plc:y");
        directory.seed_block(S2, "did:plc:x");
        reconciler.run(&handles()).await.unwrap();

        directory.unseed_block(S1, "did:plc:x");
        let report = reconciler.run(&handles()).await.unwrap();

        assert_eq!(report.rows_deleted, 1);
        assert!(db.get_subscription_block(S1, "did:plc:x").await.unwrap().is_none());
        // Still endorsed by the second subscriber
        assert!(db.get_subscription_block(S2, "did:plc:x").await.unwrap().is_some());
        assert_eq!(subjects_of(&db, S1).await, vec!["did:plc:y"]);
    }

    #[tokio::test]
    async fn rerun_without_changes_is_noop() {
        let (_db, directory, reconciler, _temp_dir) = setup().await;
        directory.seed_block(S1, "did:plc:a");
        directory.seed_block(S2, "did:plc:b");
        reconciler.run(&handles()).await.unwrap();

        let report = reconciler.run(&handles()).await.unwrap();
        assert!(report.is_noop(), "{report}");
    }

    #[tokio::test]
    async fn failed_listing_keeps_previous_rows() {
        let (db, directory, reconciler, _temp_dir) = setup().await;
        directory.seed_block(S1, "did:plc:a");
        directory.seed_block(S2, "did:plc:b");
        reconciler.run(&handles()).await.unwrap();

        directory.fail_repo(S1);
        directory.unseed_block(S2, "did:plc:b");
        let report = reconciler.run(&handles()).await.unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(subjects_of(&db, S1).await, vec!["did:plc:a"]);
        assert!(subjects_of(&db, S2).await.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_handle_keeps_previous_rows() {
        let (db, directory, reconciler, _temp_dir) = setup().await;
        directory.seed_block(S1, "did:plc:a");
        reconciler.run(&handles()).await.unwrap();

        directory.forget_handle("s1.test");
        let report = reconciler.run(&handles()).await.unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(subjects_of(&db, S1).await, vec!["did:plc:a"]);
        assert!(db.get_subscription(S1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unsubscribed_rows_are_dropped() {
        let (db, directory, reconciler, _temp_dir) = setup().await;
        directory.seed_block(S1, "did:plc:a");
        directory.seed_block(S2, "did:plc:b");
        reconciler.run(&handles()).await.unwrap();

        reconciler.run(&["s2.test".to_string()]).await.unwrap();

        assert!(subjects_of(&db, S1).await.is_empty());
        assert!(db.get_subscription(S1).await.unwrap().is_none());
        assert_eq!(subjects_of(&db, S2).await, vec!["did:plc:b"]);
    }
}
