//! Snapshot pipeline for one (target, backup set) pair.
//!
//! States run in order and any failure abandons the rest of the pipeline:
//! - EnsureBaseDir: `mkdir -p` the remote base directory
//! - ClearStaging: remove a staging directory left by an earlier crash
//! - ResolveLatest: newest existing snapshot, if any
//! - Transfer: rsync into staging, hard-linking against the latest snapshot
//! - Promote: rename staging to a timestamp name
//! - EnforceRetention: remove snapshots older than the cutoff
//!
//! A failed transfer or promotion leaves staging in place for inspection.
//! Nothing becomes visible under a snapshot name before its transfer
//! has succeeded.

pub mod snapshot;
pub mod stats;

use chrono::{DateTime, Local, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::BackupTarget;
use crate::remote::{CommandRunner, ProcessRunner, RemoteExecutor, TransferRequest};
use crate::report::{Aggregator, Outcome, PairRef};
use crate::retention::Retention;
use crate::utils::errors::{CommandError, PipelineError};
use snapshot::{
    expired_snapshots, join_remote, latest_snapshot, latest_timestamped, next_snapshot_name, snapshots,
    STAGING_DIR,
};
use stats::TransferStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    EnsureBaseDir,
    ClearStaging,
    ResolveLatest,
    Transfer,
    Promote,
    EnforceRetention,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::EnsureBaseDir => "ensure base directory",
            PipelineStage::ClearStaging => "clear staging",
            PipelineStage::ResolveLatest => "resolve latest snapshot",
            PipelineStage::Transfer => "transfer",
            PipelineStage::Promote => "promote",
            PipelineStage::EnforceRetention => "enforce retention",
            PipelineStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A backup set ready to run: local source exists, retention resolved,
/// global excludes merged in front of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDataset {
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub excludes: Vec<String>,
    pub retention: Retention,
}

impl BackupDataset {
    pub fn staging_dir(&self) -> String {
        join_remote(&self.remote_dir, STAGING_DIR)
    }

    pub fn pair(&self, target: &BackupTarget) -> PairRef {
        PairRef {
            target: target.destination(),
            local_dir: self.local_dir.display().to_string(),
            remote_dir: self.remote_dir.clone(),
        }
    }
}

/// What a successful pipeline produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub snapshot: String,
    pub linked_against: Option<String>,
    pub pruned: Vec<String>,
    pub stats: TransferStats,
}

impl PipelineSummary {
    fn message(&self, target: &BackupTarget, dataset: &BackupDataset) -> String {
        let mut msg = format!(
            "Successfully completed backup of:\n{}\n\nTo:\n{}\n\nOn:\n{}\n\nSnapshot:\n{}\n",
            dataset.local_dir.display(),
            dataset.remote_dir,
            target.address,
            self.snapshot
        );
        match &self.linked_against {
            Some(prior) => msg.push_str(&format!("\nHard-linked against:\n{prior}\n")),
            None => msg.push_str("\nFull transfer (no prior snapshot).\n"),
        }
        if !self.stats.is_empty() {
            msg.push_str(&format!("\nTransfer:\n{}\n", self.stats));
        }
        if !self.pruned.is_empty() {
            msg.push_str(&format!(
                "\nRemoved {} snapshot(s) past retention:\n{}\n",
                self.pruned.len(),
                self.pruned.join("\n")
            ));
        }
        msg
    }
}

/// Source of "now" for snapshot names and snapshot ages.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

fn abort(stage: PipelineStage, message: impl Into<String>) -> impl FnOnce(CommandError) -> PipelineError {
    let message = message.into();
    move |source| PipelineError {
        stage,
        message,
        source,
    }
}

/// Drives the snapshot pipeline against remote hosts.
pub struct Orchestrator<R = ProcessRunner> {
    executor: RemoteExecutor<R>,
    clock: Clock,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(executor: RemoteExecutor<R>) -> Self {
        Self {
            executor,
            clock: Arc::new(Local::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn executor(&self) -> &RemoteExecutor<R> {
        &self.executor
    }

    /// Run one pipeline and record exactly one outcome for it.
    ///
    /// Returns whether the pipeline succeeded. Failures never propagate.
    pub async fn run(
        &self,
        target: &BackupTarget,
        dataset: &BackupDataset,
        aggregator: &Aggregator,
    ) -> bool {
        let pair = dataset.pair(target);
        match self.run_pipeline(target, dataset).await {
            Ok(summary) => {
                info!(
                    host = %target.address,
                    remote_dir = %dataset.remote_dir,
                    snapshot = %summary.snapshot,
                    pruned = summary.pruned.len(),
                    "Backup set completed"
                );
                aggregator.record(Outcome::success(summary.message(target, dataset)).for_pair(pair));
                true
            }
            Err(err) => {
                error!(
                    host = %target.address,
                    remote_dir = %dataset.remote_dir,
                    stage = %err.stage,
                    error = %err.source,
                    "Backup set failed"
                );
                aggregator.record(
                    Outcome::error(err.message.clone())
                        .for_pair(pair)
                        .with_failure(&err.source),
                );
                false
            }
        }
    }

    pub async fn run_pipeline(
        &self,
        target: &BackupTarget,
        dataset: &BackupDataset,
    ) -> Result<PipelineSummary, PipelineError> {
        let base = dataset.remote_dir.as_str();
        let staging = dataset.staging_dir();
        let host = target.address.as_str();

        info!(host, remote_dir = base, stage = %PipelineStage::EnsureBaseDir, "Starting backup set");
        self.executor
            .execute(target, &["mkdir", "-p", base])
            .await
            .map_err(abort(
                PipelineStage::EnsureBaseDir,
                format!("Could not create remote directory:\n{base}\n\nBackup set skipped."),
            ))?;

        debug!(host, remote_dir = base, stage = %PipelineStage::ClearStaging, "Clearing staging directory");
        self.executor
            .execute(target, &["rm", "-fR", staging.as_str()])
            .await
            .map_err(abort(
                PipelineStage::ClearStaging,
                format!("Could not remove remote temp directory:\n{staging}\n\nBackup set skipped."),
            ))?;

        let listing = self
            .executor
            .list_directories(target, base)
            .await
            .map_err(abort(
                PipelineStage::ResolveLatest,
                "Could not get latest directory. Backup set skipped.",
            ))?;
        let latest = latest_snapshot(&listing).map(str::to_string);
        let newest_named = latest_timestamped(&listing).map(str::to_string);
        match &latest {
            Some(name) => info!(host, remote_dir = base, latest = %name, "Incremental transfer"),
            None => info!(host, remote_dir = base, "No prior snapshot, full transfer"),
        }

        let link_dest = latest.as_ref().map(|name| format!("../{name}"));
        let request = TransferRequest {
            local_dir: &dataset.local_dir,
            remote_staging: &staging,
            excludes: &dataset.excludes,
            link_dest: link_dest.as_deref(),
        };
        let output = self
            .executor
            .transfer(target, &request)
            .await
            .map_err(abort(
                PipelineStage::Transfer,
                "Rsync failed. Backup set skipped.",
            ))?;
        let stats = TransferStats::parse(&output.stdout);
        debug!(host, remote_dir = base, %stats, "Transfer finished");

        let name = next_snapshot_name((self.clock)(), newest_named.as_deref());
        let destination = join_remote(base, &name);
        self.executor
            .execute(target, &["mv", staging.as_str(), destination.as_str()])
            .await
            .map_err(abort(
                PipelineStage::Promote,
                format!(
                    "Renaming temp backup dir from:\n{staging}\n\nto:\n{destination}\n\nBackup set skipped."
                ),
            ))?;
        info!(host, remote_dir = base, snapshot = %name, stage = %PipelineStage::Promote, "Snapshot promoted");

        let pruned = self.enforce_retention(target, dataset).await?;

        debug!(host, remote_dir = base, stage = %PipelineStage::Done, "Pipeline finished");
        Ok(PipelineSummary {
            snapshot: name,
            linked_against: latest,
            pruned,
            stats,
        })
    }

    /// Remove snapshots strictly older than the backup set's retention.
    async fn enforce_retention(
        &self,
        target: &BackupTarget,
        dataset: &BackupDataset,
    ) -> Result<Vec<String>, PipelineError> {
        let base = dataset.remote_dir.as_str();
        let listing = self
            .executor
            .list_directories(target, base)
            .await
            .map_err(abort(
                PipelineStage::EnforceRetention,
                "Listing directories to get rid of old backups (outside of retention period) failed. Backup set skipped.",
            ))?;

        let now: DateTime<Utc> = (self.clock)().with_timezone(&Utc);
        let expired: Vec<String> = expired_snapshots(&listing, dataset.retention, now)
            .into_iter()
            .map(str::to_string)
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        let remaining = snapshots(&listing).count() - expired.len();
        if remaining == 0 {
            warn!(
                host = %target.address,
                remote_dir = base,
                retention = %dataset.retention,
                "Retention removes every snapshot of this backup set"
            );
        }

        let paths: Vec<String> = expired.iter().map(|name| join_remote(base, name)).collect();
        let mut argv = vec!["rm", "-fR"];
        argv.extend(paths.iter().map(String::as_str));
        self.executor
            .execute(target, &argv)
            .await
            .map_err(abort(
                PipelineStage::EnforceRetention,
                "Removing old backup directories failed. Backup set skipped.",
            ))?;
        info!(
            host = %target.address,
            remote_dir = base,
            count = expired.len(),
            "Removed snapshots past retention"
        );
        Ok(expired)
    }
}
