//! Run orchestration
//!
//! One run authenticates, then executes the spam, subscription and
//! repository sync passes strictly in sequence. A pass that fails is logged
//! and the next pass still runs; only authentication failure ends the run.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

use super::{PassReport, RepoSyncReconciler, SpamReconciler, SubscriptionReconciler};
use crate::atproto::DirectoryClient;
use crate::config::AppConfig;
use crate::data::{Database, HandleCache};
use crate::error::AppError;
use crate::metrics;

/// Outcome of one full run; a `None` pass failed and was skipped
#[derive(Debug, Clone)]
pub struct RunReport {
    /// DID of the authenticated owner
    pub owner: String,
    pub spam: Option<PassReport>,
    pub subscription: Option<PassReport>,
    pub repo_sync: Option<PassReport>,
    pub duration: Duration,
}

impl RunReport {
    /// Names of the passes that did not complete
    pub fn failed_passes(&self) -> Vec<&'static str> {
        [
            ("spam", &self.spam),
            ("subscription", &self.subscription),
            ("repo_sync", &self.repo_sync),
        ]
        .into_iter()
        .filter(|(_, pass)| pass.is_none())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Sequences the reconcilers and owns their shared state
pub struct Orchestrator {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    client: Arc<dyn DirectoryClient>,
    handles: Arc<HandleCache>,
}

impl Orchestrator {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, client: Arc<dyn DirectoryClient>) -> Self {
        Self {
            config,
            db,
            client,
            handles: Arc::new(HandleCache::default()),
        }
    }

    /// Execute one full reconciliation run
    ///
    /// # Errors
    /// `Unauthorized` (or the transport error) when login fails; nothing is
    /// written in that case.
    pub async fn run_once(&self) -> Result<RunReport, AppError> {
        let started = Instant::now();
        self.handles.cleanup_expired().await;

        let session = self
            .client
            .authenticate(&self.config.atproto.username, &self.config.atproto.password)
            .await?;
        let owner = session.did;

        let spam = SpamReconciler::new(self.db.clone(), self.client.clone(), self.handles.clone())
            .run(&owner, self.config.blocking.follow_limit)
            .await;
        let spam = finish_pass("spam", spam);

        let subscription = SubscriptionReconciler::new(self.db.clone(), self.client.clone())
            .run(&self.config.blocking.subscriptions)
            .await;
        let subscription = finish_pass("subscription", subscription);

        let repo_sync = RepoSyncReconciler::new(self.db.clone(), self.client.clone(), self.handles.clone())
            .run(&owner)
            .await;
        let repo_sync = finish_pass("repo_sync", repo_sync);

        let report = RunReport {
            owner,
            spam,
            subscription,
            repo_sync,
            duration: started.elapsed(),
        };
        self.export_metrics(&report);

        tracing::info!(
            owner = %report.owner,
            duration_ms = report.duration.as_millis() as u64,
            failed_passes = ?report.failed_passes(),
            "Reconciliation run complete"
        );
        Ok(report)
    }

    /// Run every `interval` until the future is dropped
    ///
    /// Runs are awaited inline, so a run that outlasts the interval delays
    /// the next tick instead of overlapping it.
    pub async fn run_scheduled(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            tracing::info!("Starting scheduled reconciliation run...");

            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Scheduled run failed");
            }
        }
    }

    fn export_metrics(&self, report: &RunReport) {
        metrics::RUN_DURATION_SECONDS.observe(report.duration.as_secs_f64());
        metrics::LAST_RUN_TIMESTAMP_SECONDS.set(chrono::Utc::now().timestamp());

        if let Some(path) = &self.config.metrics.textfile_path {
            if let Err(e) = metrics::write_textfile(path) {
                tracing::error!(error = %e, path = %path.display(), "Failed to write metrics textfile");
            }
        }
    }
}

fn finish_pass(pass: &'static str, result: Result<PassReport, AppError>) -> Option<PassReport> {
    match result {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(pass, kind = e.kind(), error = %e, "Pass failed, continuing with the next one");
            None
        }
    }
}
