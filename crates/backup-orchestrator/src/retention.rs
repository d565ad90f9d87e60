//! Retention pruning of old runs.
//!

use std::fs;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    BackupRoot, Context, Manifest, PointerPublisher, RunId, RunStatus, staging::sync_directory,
};

/// Which runs are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Succeeded runs older than this are eligible for deletion.
    pub max_age_days: u32,

    /// Pruning never leaves fewer succeeded runs than this.
    pub min_keep_count: usize,

    /// Runs that did not succeed are eligible for deletion once older than this.
    pub failed_grace_hours: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            min_keep_count: 7,
            failed_grace_hours: 24,
        }
    }
}

/// What the pruner needs to know about a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// The run id.
    pub id: RunId,

    /// The manifest's status, `None` if the run has no readable manifest.
    pub status: Option<RunStatus>,

    /// When the run finished, or started if that is unknown.
    pub finished_at: DateTime<Utc>,
}

/// The runs to delete, oldest first.
pub fn plan(
    runs: &[RunSummary],
    policy: &RetentionPolicy,
    latest: Option<RunId>,
    now: DateTime<Utc>,
) -> Vec<RunId> {
    let max_age = TimeDelta::days(i64::from(policy.max_age_days));
    let failed_grace = TimeDelta::hours(i64::from(policy.failed_grace_hours));

    let mut runs: Vec<&RunSummary> = runs.iter().collect();
    runs.sort_by_key(|run| run.id);

    let mut succeeded_remaining = runs
        .iter()
        .filter(|run| run.status == Some(RunStatus::Succeeded))
        .count();

    let mut eligible = Vec::new();
    for run in runs {
        if Some(run.id) == latest {
            continue;
        }

        let age = now.signed_duration_since(run.finished_at);

        if run.status == Some(RunStatus::Succeeded) {
            if age > max_age && succeeded_remaining > policy.min_keep_count {
                eligible.push(run.id);
                succeeded_remaining -= 1;
            }
        } else if age > failed_grace {
            eligible.push(run.id);
        }
    }

    eligible
}

/// Read the summary of every run in the backup root.
pub fn summarize(root: &BackupRoot, context: &Context) -> std::io::Result<Vec<RunSummary>> {
    let runs = root.list_runs()?;

    Ok(runs
        .into_iter()
        .map(|id| match Manifest::load(&root.run_directory(id)) {
            Ok(manifest) => RunSummary {
                id,
                status: Some(manifest.run.status),
                finished_at: manifest.run.finished_at.unwrap_or(manifest.run.started_at),
            },
            Err(error) => {
                if !error.is_not_found() {
                    warn!("{context}Could not read manifest of {id}: {error}");
                }

                RunSummary {
                    id,
                    status: None,
                    finished_at: id.timestamp(),
                }
            }
        })
        .collect())
}

/// Delete the runs the policy no longer keeps. Best effort, failures are logged per run.
///
/// Returns the deleted runs.
pub fn prune(
    root: &BackupRoot,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    context: &mut Context,
) -> Vec<RunId> {
    context.current_context = "Prune";

    // Finish deletions a previous prune could not complete.
    match root.list_deleting() {
        Ok(leftovers) => {
            for leftover in leftovers {
                if let Err(e) = fs::remove_dir_all(&leftover) {
                    error!("{context}Could not remove {leftover:?}: {e}");
                }
            }
        }
        Err(e) => warn!("{context}Could not look for interrupted deletions: {e}"),
    }

    let runs = match summarize(root, context) {
        Ok(runs) => runs,
        Err(e) => {
            error!("{context}Could not list runs: {e}");
            return Vec::new();
        }
    };

    let publisher = PointerPublisher::new(root.clone());
    let latest = match publisher.resolve() {
        Ok(latest) => latest,
        Err(e) => {
            error!("{context}Could not resolve the latest pointer, nothing will be pruned: {e}");
            return Vec::new();
        }
    };

    if let Some(latest) = latest {
        if !runs.iter().any(|run| run.id == latest) {
            warn!("{context}Latest pointer references missing run {latest}");
        }
    }

    let eligible = plan(&runs, policy, latest, now);
    let mut deleted = Vec::new();

    for id in eligible {
        // The pointer may only move under the run lock, confirm anyway before deleting.
        match publisher.resolve() {
            Ok(Some(latest)) if latest == id => {
                warn!("{context}Not deleting {id}, it is the latest run");
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                error!("{context}Not deleting {id}, could not resolve the latest pointer: {e}");
                continue;
            }
        }

        // Renaming first makes the run disappear as a whole even if removal fails midway.
        let run_directory = root.run_directory(id);
        let deleting_directory = root.deleting_directory(id);
        if let Err(e) = fs::rename(&run_directory, &deleting_directory) {
            error!("{context}Could not delete {id}: {e}");
            continue;
        }
        if let Err(e) = sync_directory(&root.runs_directory()) {
            warn!("{context}Could not sync runs directory: {e}");
        }

        if let Err(e) = fs::remove_dir_all(&deleting_directory) {
            error!("{context}Could not remove {deleting_directory:?}, will retry next prune: {e}");
        }

        info!("{context}Deleted {id}");
        deleted.push(id);
    }

    info!(
        "{context}Pruned {} of {} runs",
        deleted.len(),
        runs.len()
    );

    deleted
}
