//! Service layer
//!
//! The reconcilers and the orchestrator that sequences them. Each reconciler
//! reads the remote directory and the local store, writes back to the store,
//! and creates or deletes block records in the owner's repository.

mod repo_sync;
mod runner;
mod spam;
mod subscription;

#[cfg(test)]
pub(crate) mod fake;

pub use repo_sync::RepoSyncReconciler;
pub use runner::{Orchestrator, RunReport};
pub use spam::SpamReconciler;
pub use subscription::SubscriptionReconciler;

use std::fmt;

use crate::atproto::DirectoryClient;
use crate::data::HandleCache;
use crate::error::AppError;

/// What one reconciler pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Block records written to the owner's repository
    pub blocks_created: usize,
    /// Block records removed from the owner's repository
    pub blocks_deleted: usize,
    /// Local rows inserted
    pub rows_inserted: usize,
    /// Local rows updated in place
    pub rows_updated: usize,
    /// Local rows deleted
    pub rows_deleted: usize,
    /// Accounts skipped after a per-item failure
    pub failures: usize,
}

impl PassReport {
    /// True when the pass changed nothing locally or remotely
    pub fn is_noop(&self) -> bool {
        self.blocks_created == 0
            && self.blocks_deleted == 0
            && self.rows_inserted == 0
            && self.rows_deleted == 0
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} deleted={} inserted={} updated={} removed={} failures={}",
            self.blocks_created,
            self.blocks_deleted,
            self.rows_inserted,
            self.rows_updated,
            self.rows_deleted,
            self.failures
        )
    }
}

/// Record a per-item failure, or hand it back if it ends the pass
fn skip_item(
    pass: &'static str,
    did: &str,
    error: AppError,
    report: &mut PassReport,
) -> Result<(), AppError> {
    if error.aborts_pass() {
        return Err(error);
    }

    tracing::warn!(pass, %did, kind = error.kind(), error = %error, "Skipping account");
    crate::metrics::ITEM_FAILURES_TOTAL
        .with_label_values(&[pass])
        .inc();
    report.failures += 1;
    Ok(())
}

/// Handle for display; falls back to the DID when the profile is unavailable
async fn display_handle(
    handles: &HandleCache,
    client: &dyn DirectoryClient,
    did: &str,
) -> Result<String, AppError> {
    match handles.get(client, did).await {
        Ok(handle) => Ok(handle),
        Err(error) if error.aborts_pass() => Err(error),
        Err(error) => {
            tracing::debug!(%did, error = %error, "No handle available, using DID");
            Ok(did.to_string())
        }
    }
}
