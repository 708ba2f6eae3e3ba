//! Repository sync reconciler
//!
//! Reconciles local user blocks with the block records actually stored in
//! the owner's repository, in both directions:
//!
//! 1. Push: subscription blocks with no user block and no record in the
//!    repository get a block record.
//! 2. Pull: block records with no user block are adopted as manual blocks.
//! 3. Prune: subscription-reason user blocks no subscription endorses are
//!    deleted remotely, then locally once the delete is confirmed.
//! 4. Manual prune: manual user blocks whose record is gone are forgotten.
//!
//! Pull always completes before either prune step starts.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{PassReport, display_handle, skip_item};
use crate::atproto::{BlockRecord, DirectoryClient, blocks, collect_all, parse_record_key};
use crate::data::{BlockReason, Collection, Database, HandleCache, UserBlock};
use crate::error::AppError;
use crate::metrics::{BLOCKS_CREATED_TOTAL, BLOCKS_DELETED_TOTAL};

const PASS: &str = "repo_sync";

/// Repository sync reconciler
pub struct RepoSyncReconciler {
    db: Arc<Database>,
    client: Arc<dyn DirectoryClient>,
    handles: Arc<HandleCache>,
}

impl RepoSyncReconciler {
    /// Create new repository sync reconciler
    pub fn new(
        db: Arc<Database>,
        client: Arc<dyn DirectoryClient>,
        handles: Arc<HandleCache>,
    ) -> Self {
        Self {
            db,
            client,
            handles,
        }
    }

    /// Run one pass against the repository of `owner`
    ///
    /// The owner's block listing is fetched once, before the push. If it
    /// cannot be fetched, the push still runs and the pull and both prune
    /// steps are skipped.
    ///
    /// # Errors
    /// Session, rate-limit and database errors end the pass.
    pub async fn run(&self, owner: &str) -> Result<PassReport, AppError> {
        tracing::info!(%owner, "Repository sync started");
        let mut report = PassReport::default();

        let listing = match collect_all(blocks(self.client.as_ref(), owner)).await {
            Ok(records) => {
                tracing::debug!(records = records.len(), "Repository block records listed");
                Some(records)
            }
            Err(error) if error.aborts_pass() => return Err(error),
            Err(error) => {
                tracing::error!(error = %error, "Failed to list repository blocks, skipping pull and prune");
                crate::metrics::ITEM_FAILURES_TOTAL
                    .with_label_values(&[PASS])
                    .inc();
                report.failures += 1;
                None
            }
        };

        self.push_missing(owner, listing.as_deref(), &mut report).await?;

        let Some(remote) = listing else {
            tracing::info!(%report, "Repository sync finished without pull and prune");
            return Ok(report);
        };

        self.pull_manual(&remote, &mut report).await?;

        let remote_keys: HashMap<&str, String> = remote
            .iter()
            .filter_map(|record| {
                let rkey = parse_record_key(&record.uri).ok()?;
                Some((record.subject.as_str(), rkey))
            })
            .collect();
        self.prune_orphans(owner, &remote_keys, &mut report).await?;
        self.prune_manual(&remote, &mut report).await?;

        tracing::info!(%report, "Repository sync finished");
        Ok(report)
    }

    /// Create block records for subscription blocks not yet in user blocks
    ///
    /// Subjects the repository already blocks are left for the pull to adopt.
    async fn push_missing(
        &self,
        owner: &str,
        remote: Option<&[BlockRecord]>,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let present: HashSet<&str> = remote
            .unwrap_or_default()
            .iter()
            .map(|record| record.subject.as_str())
            .collect();
        let missing = self
            .db
            .set_difference(
                Collection::SubscriptionBlocks,
                Collection::UserBlocks,
                Some(BlockReason::Subscription),
            )
            .await?;
        tracing::debug!(count = missing.len(), "Subscription blocks missing from repository");

        for did in missing {
            if did == owner {
                tracing::debug!("A subscription blocks the owner, skipping");
                continue;
            }
            if present.contains(did.as_str()) {
                tracing::debug!(%did, "Already blocked in repository, skipping create");
                continue;
            }
            if let Err(error) = self.push_one(owner, &did, report).await {
                skip_item(PASS, &did, error, report)?;
            }
        }
        Ok(())
    }

    async fn push_one(&self, owner: &str, did: &str, report: &mut PassReport) -> Result<(), AppError> {
        // Resolved first so a created record always gets its local row
        let handle = display_handle(&self.handles, self.client.as_ref(), did).await?;
        let created = self.client.create_block(owner, did).await?;
        report.blocks_created += 1;
        BLOCKS_CREATED_TOTAL
            .with_label_values(&[BlockReason::Subscription.as_str()])
            .inc();

        let rkey = match parse_record_key(&created.uri) {
            Ok(rkey) => Some(rkey),
            Err(error) => {
                tracing::error!(%did, uri = %created.uri, error = %error, "Created block has a malformed URI");
                None
            }
        };

        let now = Utc::now();
        self.db
            .insert_user_block(&UserBlock {
                did: did.to_string(),
                handle: handle.clone(),
                rkey,
                reason: BlockReason::Subscription,
                date_blocked: now,
                last_updated: now,
            })
            .await?;
        report.rows_inserted += 1;

        tracing::info!(%did, %handle, "Blocked from subscription");
        Ok(())
    }

    /// Adopt block records made outside this tool as manual blocks
    async fn pull_manual(
        &self,
        remote: &[BlockRecord],
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let mut known: HashSet<String> = self
            .db
            .get_all_user_blocks()
            .await?
            .into_iter()
            .map(|block| block.did)
            .collect();

        for record in remote {
            if known.contains(&record.subject) {
                continue;
            }
            match self.pull_one(record).await {
                Ok(()) => {
                    known.insert(record.subject.clone());
                    report.rows_inserted += 1;
                }
                Err(error) => skip_item(PASS, &record.subject, error, report)?,
            }
        }
        Ok(())
    }

    async fn pull_one(&self, record: &BlockRecord) -> Result<(), AppError> {
        let handle = display_handle(&self.handles, self.client.as_ref(), &record.subject).await?;
        let rkey = match parse_record_key(&record.uri) {
            Ok(rkey) => Some(rkey),
            Err(error) => {
                tracing::warn!(uri = %record.uri, error = %error, "Repository block has a malformed URI");
                None
            }
        };

        self.db
            .insert_user_block(&UserBlock {
                did: record.subject.clone(),
                handle: handle.clone(),
                rkey,
                reason: BlockReason::Manual,
                date_blocked: record.created_at,
                last_updated: Utc::now(),
            })
            .await?;

        tracing::info!(did = %record.subject, %handle, "Manual block recorded");
        Ok(())
    }

    /// Remove subscription blocks that no subscription endorses anymore
    async fn prune_orphans(
        &self,
        owner: &str,
        remote_keys: &HashMap<&str, String>,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let orphaned = self
            .db
            .set_difference(
                Collection::UserBlocks,
                Collection::SubscriptionBlocks,
                Some(BlockReason::Subscription),
            )
            .await?;
        tracing::debug!(count = orphaned.len(), "Orphaned subscription blocks");

        for did in orphaned {
            if let Err(error) = self.prune_one(owner, &did, remote_keys, report).await {
                skip_item(PASS, &did, error, report)?;
            }
        }
        Ok(())
    }

    async fn prune_one(
        &self,
        owner: &str,
        did: &str,
        remote_keys: &HashMap<&str, String>,
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let Some(block) = self.db.get_user_block(did).await? else {
            return Ok(());
        };

        let rkey = match block.rkey.clone().or_else(|| remote_keys.get(did).cloned()) {
            Some(rkey) => rkey,
            None => {
                return Err(AppError::Validation(format!(
                    "no record key known for block of {did}"
                )));
            }
        };

        let outcome = self.client.delete_block(owner, &rkey).await?;
        if !outcome.is_success() {
            return Err(AppError::Remote {
                status: outcome.status,
                error: "DeleteNotConfirmed".to_string(),
                message: format!("deleteRecord returned {}, keeping local block", outcome.status),
            });
        }
        report.blocks_deleted += 1;

        if self.db.delete_user_block(did).await? {
            report.rows_deleted += 1;
            BLOCKS_DELETED_TOTAL
                .with_label_values(&[BlockReason::Subscription.as_str()])
                .inc();
        }

        tracing::info!(%did, handle = %block.handle, %rkey, "Unblocked orphaned subscription block");
        Ok(())
    }

    /// Forget manual blocks whose record was removed through another client
    async fn prune_manual(
        &self,
        remote: &[BlockRecord],
        report: &mut PassReport,
    ) -> Result<(), AppError> {
        let present: HashSet<&str> = remote.iter().map(|record| record.subject.as_str()).collect();

        for block in self.db.user_blocks_by_reason(&[BlockReason::Manual]).await? {
            if present.contains(block.did.as_str()) {
                continue;
            }
            if self.db.delete_user_block(&block.did).await? {
                report.rows_deleted += 1;
                BLOCKS_DELETED_TOTAL
                    .with_label_values(&[BlockReason::Manual.as_str()])
                    .inc();
                tracing::info!(did = %block.did, handle = %block.handle, "Manual block removed remotely, forgetting");
            }
        }
        Ok(())
    }
}
