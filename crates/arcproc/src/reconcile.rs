//! Reconciliation of desired job descriptions against the store.
//!
//! An external enumeration process decides which jobs *should* exist (for
//! example by scanning the observation archive) and hands the result here
//! as [`JobDescription`] values. Reconciliation diffs each description
//! against the stored job with the same tag and converges the store:
//! create, update the changed fields, or soft-delete. Descriptions are
//! serde types so the enumeration can run out of process and supply JSON.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::db::error::StoreError;
use crate::db::graph_repo::ObsInfo;
use crate::db::job_store::{
    add_job, apply_job_update, change_state, get_job_by_tag, AddJob, JobChanges,
};
use crate::db::{file_repo, graph_repo, task_repo, Database};
use crate::state::JobState;

/// A parent edge in a desired-job description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentSpec {
    pub id: i64,
    /// Regular expression selecting which parent outputs feed this job.
    #[serde(default)]
    pub filter: String,
}

/// What a job should look like, keyed by tag.
///
/// A description with neither input files nor parents is "empty" and means
/// the job should not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub tag: String,
    pub location: String,
    pub mode: String,
    pub task: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub parents: Vec<ParentSpec>,
    #[serde(default)]
    pub tiles: Option<Vec<i64>>,
    #[serde(default)]
    pub obs: Option<BTreeMap<String, String>>,
}

impl JobDescription {
    pub fn is_empty(&self) -> bool {
        self.input_files.is_empty() && self.parents.is_empty()
    }
}

/// What the reconciler is allowed to do.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub allow_add: bool,
    pub allow_upd: bool,
    pub allow_del: bool,
    /// Permit acting on a job in an active state.
    pub force: bool,
    /// Log the would-be action without writing anything.
    pub dry_run: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            allow_add: true,
            allow_upd: true,
            allow_del: true,
            force: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Absent only for a dry-run create, where no id was allocated.
    pub job_id: Option<i64>,
    pub action: ReconcileAction,
}

/// Counters from a batch reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
}

fn desired_parents(desired: &JobDescription) -> Vec<(i64, String)> {
    desired
        .parents
        .iter()
        .map(|p| (p.id, p.filter.clone()))
        .collect()
}

fn desired_obs(desired: &JobDescription) -> Vec<ObsInfo> {
    desired
        .obs
        .iter()
        .flatten()
        .map(|(keyword, value)| ObsInfo {
            keyword: keyword.clone(),
            value: value.clone(),
        })
        .collect()
}

fn warn_unknown_task(db: &Database, desired: &JobDescription) {
    if let Err(e) = task_repo::get_task_info(db, &desired.task) {
        if e.is_no_rows() {
            log::warn!(
                "Job '{}' names task '{}' which is not registered",
                desired.tag,
                desired.task
            );
        }
    }
}

/// Converges one stored job towards its description.
///
/// Returns `None` when there is nothing to do because the description is
/// empty and no job with that tag exists.
pub fn reconcile(
    db: &Database,
    desired: &JobDescription,
    opts: &ReconcileOptions,
) -> Result<Option<ReconcileOutcome>, StoreError> {
    let existing = match get_job_by_tag(db, &desired.tag) {
        Ok(job) => Some(job),
        Err(e) if e.is_no_rows() => None,
        Err(e) => return Err(e),
    };

    if desired.is_empty() {
        let job = match existing {
            Some(job) => job,
            None => return Ok(None),
        };

        if job.state == JobState::Deleted {
            return Ok(Some(ReconcileOutcome {
                job_id: Some(job.id),
                action: ReconcileAction::Unchanged,
            }));
        }
        if !opts.allow_del {
            return Err(StoreError::InvalidArgument(format!(
                "job '{}' should be deleted but deletions are not allowed",
                desired.tag
            )));
        }
        if job.state.info().active && !opts.force {
            return Err(StoreError::InvalidArgument(format!(
                "job '{}' is active ({}); refusing to delete without force",
                desired.tag, job.state
            )));
        }

        if opts.dry_run {
            log::info!("[dry run] Would delete job {} ('{}')", job.id, job.tag);
        } else {
            change_state(
                db,
                job.id,
                JobState::Deleted,
                "Job withdrawn during reconciliation",
                None,
            )?;
            log::info!("Deleted job {} ('{}')", job.id, job.tag);
        }
        return Ok(Some(ReconcileOutcome {
            job_id: Some(job.id),
            action: ReconcileAction::Deleted,
        }));
    }

    let job = match existing {
        None => {
            if !opts.allow_add {
                return Err(StoreError::InvalidArgument(format!(
                    "job '{}' should be added but additions are not allowed",
                    desired.tag
                )));
            }
            warn_unknown_task(db, desired);

            if opts.dry_run {
                log::info!("[dry run] Would add job '{}'", desired.tag);
                return Ok(Some(ReconcileOutcome {
                    job_id: None,
                    action: ReconcileAction::Created,
                }));
            }

            let mut add = AddJob::new(&desired.tag, &desired.location, &desired.mode, &desired.task);
            add.parameters = desired.parameters.clone();
            add.priority = desired.priority;
            add.input_files = desired.input_files.clone();
            add.parents = desired_parents(desired);
            add.tilelist = desired.tiles.clone().unwrap_or_default();
            add.obs = desired_obs(desired);
            let job_id = add_job(db, &add)?;
            log::info!("Added job {} ('{}')", job_id, desired.tag);
            return Ok(Some(ReconcileOutcome {
                job_id: Some(job_id),
                action: ReconcileAction::Created,
            }));
        }
        Some(job) => job,
    };

    warn_unknown_task(db, desired);

    // Field-by-field diff; only changed fields go into the update.
    let mut changes = JobChanges::default();

    let current_inputs: BTreeSet<String> = match file_repo::get_input_files(db, job.id) {
        Ok(files) => files.into_iter().collect(),
        Err(e) if e.is_no_rows() => BTreeSet::new(),
        Err(e) => return Err(e),
    };
    let wanted_inputs: BTreeSet<String> = desired.input_files.iter().cloned().collect();
    if current_inputs != wanted_inputs {
        changes.input_files = Some(desired.input_files.clone());
    }

    let current_parents: BTreeSet<(i64, String)> = match graph_repo::get_parents(db, job.id) {
        Ok(parents) => parents.into_iter().collect(),
        Err(e) if e.is_no_rows() => BTreeSet::new(),
        Err(e) => return Err(e),
    };
    let wanted_parents: BTreeSet<(i64, String)> = desired_parents(desired).into_iter().collect();
    if current_parents != wanted_parents {
        changes.parents = Some(desired_parents(desired));
    }

    if job.mode != desired.mode {
        changes.mode = Some(desired.mode.clone());
    }
    if job.parameters != desired.parameters {
        changes.parameters = Some(desired.parameters.clone());
    }
    if job.priority != desired.priority {
        changes.priority = Some(desired.priority);
    }

    if let Some(tiles) = &desired.tiles {
        let current_tiles: BTreeSet<i64> = match graph_repo::get_tilelist(db, job.id) {
            Ok(tiles) => tiles.into_iter().collect(),
            Err(e) if e.is_no_rows() => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        if current_tiles != tiles.iter().copied().collect() {
            changes.tilelist = Some(tiles.clone());
        }
    }

    if desired.obs.is_some() {
        let current_obs: BTreeMap<String, String> = match graph_repo::get_obs_info(db, job.id) {
            Ok(obs) => obs.into_iter().map(|o| (o.keyword, o.value)).collect(),
            Err(e) if e.is_no_rows() => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        if Some(&current_obs) != desired.obs.as_ref() {
            changes.obs = Some(desired_obs(desired));
        }
    }

    // A previously withdrawn job described as wanted again is restored.
    let restore = job.state == JobState::Deleted;

    if changes.is_empty() && !restore {
        return Ok(Some(ReconcileOutcome {
            job_id: Some(job.id),
            action: ReconcileAction::Unchanged,
        }));
    }

    if !opts.allow_upd {
        return Err(StoreError::InvalidArgument(format!(
            "job '{}' should be updated but updates are not allowed",
            desired.tag
        )));
    }

    // A worker owns the job right now; any update needs force, even one
    // that would not invalidate results.
    if job.state.info().active && !opts.force {
        return Err(StoreError::InvalidArgument(format!(
            "job '{}' is active ({}); refusing to update without force",
            desired.tag, job.state
        )));
    }

    let reset_state = changes.is_load_bearing() || restore;

    if opts.dry_run {
        log::info!(
            "[dry run] Would update job {} ('{}'): {:?}",
            job.id,
            job.tag,
            changes
        );
        return Ok(Some(ReconcileOutcome {
            job_id: Some(job.id),
            action: ReconcileAction::Updated,
        }));
    }

    apply_job_update(db, job.id, &changes)?;
    if reset_state {
        let message = if restore {
            "Job restored during reconciliation"
        } else {
            "Job definition changed during reconciliation"
        };
        change_state(db, job.id, JobState::Unknown, message, None)?;
    }
    log::info!("Updated job {} ('{}')", job.id, job.tag);

    Ok(Some(ReconcileOutcome {
        job_id: Some(job.id),
        action: ReconcileAction::Updated,
    }))
}

/// Reconciles a whole batch of descriptions. Per-description failures are
/// logged and counted; the batch always runs to completion.
pub fn reconcile_all(
    db: &Database,
    descriptions: &[JobDescription],
    opts: &ReconcileOptions,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();

    for desired in descriptions {
        match reconcile(db, desired, opts) {
            Ok(None) => {}
            Ok(Some(outcome)) => match outcome.action {
                ReconcileAction::Created => summary.created += 1,
                ReconcileAction::Updated => summary.updated += 1,
                ReconcileAction::Deleted => summary.deleted += 1,
                ReconcileAction::Unchanged => summary.unchanged += 1,
            },
            Err(e) => {
                log::error!("Failed to reconcile job '{}': {}", desired.tag, e);
                summary.failed += 1;
            }
        }
    }

    summary
}
