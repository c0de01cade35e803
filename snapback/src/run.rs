//! Run driver: every configured target × every usable backup set.
//!
//! Each pair runs as its own task. A global semaphore bounds the whole run
//! and a per-target semaphore bounds load on any one remote ssh daemon;
//! with both at 1 the run is sequential.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BackupTarget, Config};
use crate::pipeline::{BackupDataset, Orchestrator};
use crate::remote::{CommandRunner, ProcessRunner};
use crate::report::{Aggregator, Outcome};
use crate::retention;

/// Turn configured backup sets into runnable datasets.
///
/// A missing local directory drops the set from every target with a
/// warning. Unusable retention policies fall back to the default with a
/// warning.
pub fn prepare_datasets(config: &Config, aggregator: &Aggregator) -> Vec<BackupDataset> {
    let mut datasets = Vec::with_capacity(config.backupsets.len());
    for set in &config.backupsets {
        let local = set.localdir.display().to_string();
        if !set.localdir.is_dir() {
            warn!(localdir = %local, "Local backup directory missing, backup set skipped");
            aggregator.add_warning(
                format!(
                    "Local Backup Directory Missing\nLocal directory to backup, {local} does not exist. Should it? Backup set skipped."
                ),
                None,
            );
            continue;
        }

        let resolution = retention::resolve(set.retention.as_deref());
        if let Some(warning) = &resolution.warning {
            warn!(localdir = %local, %warning, "Retention policy defaulted");
            aggregator.add_warning(
                format!("{warning} Retention for {local} defaulting to 12 weeks."),
                None,
            );
        }

        let excludes = config
            .global_excludes()
            .chain(set.excludes.iter().map(|e| e.exclude.as_str()))
            .map(str::to_string)
            .collect();

        datasets.push(BackupDataset {
            local_dir: set.localdir.clone(),
            remote_dir: set.remotedir.clone(),
            excludes,
            retention: resolution.retention,
        });
    }
    datasets
}

async fn acquire_both(
    per_target: Arc<Semaphore>,
    global: Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let target_permit = per_target.acquire_owned().await.ok()?;
    let global_permit = global.acquire_owned().await.ok()?;
    Some((target_permit, global_permit))
}

pub struct BackupRun<R = ProcessRunner> {
    targets: Vec<Arc<BackupTarget>>,
    datasets: Vec<Arc<BackupDataset>>,
    orchestrator: Arc<Orchestrator<R>>,
    aggregator: Arc<Aggregator>,
    max_parallel: usize,
    max_per_target: usize,
}

impl<R: CommandRunner> BackupRun<R> {
    /// Prepare datasets from the config. Preparation warnings land in the
    /// run's aggregator.
    pub fn new(config: &Config, orchestrator: Orchestrator<R>) -> Self {
        let aggregator = Arc::new(Aggregator::new());
        let datasets = prepare_datasets(config, &aggregator)
            .into_iter()
            .map(Arc::new)
            .collect();
        Self {
            targets: config.backuptargets.iter().cloned().map(Arc::new).collect(),
            datasets,
            orchestrator: Arc::new(orchestrator),
            aggregator,
            max_parallel: config.maxparallel.max(1),
            max_per_target: config.maxpertarget.max(1),
        }
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn datasets(&self) -> &[Arc<BackupDataset>] {
        &self.datasets
    }

    /// Run every pipeline and return the filled aggregator.
    ///
    /// Once `cancel` fires, pipelines that have not started are skipped with
    /// a warning; running ones are left to finish or time out.
    pub async fn execute(self, cancel: CancellationToken) -> Arc<Aggregator> {
        info!(
            targets = self.targets.len(),
            backup_sets = self.datasets.len(),
            max_parallel = self.max_parallel,
            max_per_target = self.max_per_target,
            "Starting backup run"
        );

        let global = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::with_capacity(self.targets.len() * self.datasets.len());

        for target in &self.targets {
            let per_target = Arc::new(Semaphore::new(self.max_per_target));
            for dataset in &self.datasets {
                let pair = dataset.pair(target);
                let target = Arc::clone(target);
                let dataset = Arc::clone(dataset);
                let orchestrator = Arc::clone(&self.orchestrator);
                let aggregator = Arc::clone(&self.aggregator);
                let per_target = Arc::clone(&per_target);
                let global = Arc::clone(&global);
                let cancel = cancel.clone();
                let skipped = pair.clone();

                let handle = tokio::spawn(async move {
                    let permits = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permits = acquire_both(per_target, global) => permits,
                    };
                    let _permits = match permits {
                        Some(permits) if !cancel.is_cancelled() => permits,
                        _ => {
                            info!(backup_set = %skipped, "Run cancelled, backup set not started");
                            aggregator.record(
                                Outcome::warning("Run cancelled before this backup set started. Backup set skipped.")
                                    .for_pair(skipped),
                            );
                            return;
                        }
                    };
                    orchestrator.run(&target, &dataset, &aggregator).await;
                });
                handles.push((pair, handle));
            }
        }

        for (pair, handle) in handles {
            if let Err(e) = handle.await {
                error!(backup_set = %pair, error = %e, "Backup task did not complete");
                self.aggregator.record(
                    Outcome::error(format!("Backup task aborted unexpectedly: {e}. Backup set skipped."))
                        .for_pair(pair),
                );
            }
        }

        let counts = self.aggregator.counts();
        info!(
            errors = counts.errors,
            warnings = counts.warnings,
            successes = counts.successes,
            "Backup run finished"
        );
        self.aggregator
    }
}
