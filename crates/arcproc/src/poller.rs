//! The polling sweep: advances every job it is responsible for by one
//! step, using guarded transitions so concurrent pollers and workers
//! cannot double-apply a step.

use crate::config::Config;
use crate::db::error::StoreError;
use crate::db::job_store::{
    change_state, find_jobs, JobQuery, JobRecord, TransitionOutcome, ALLOWED_MODES,
};
use crate::db::{file_repo, graph_repo, task_repo, Database};
use crate::resolver::{effective_inputs, NotReadyReason, Readiness};
use crate::state::JobState;

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Jobs moved forward (including deliberate moves to Error).
    pub advanced: usize,
    /// Jobs left alone: owned by another process, not yet ready, terminal,
    /// or lost to a concurrent claimer.
    pub skipped: usize,
    /// Jobs whose step failed; each was pushed to Error with the reason.
    pub errored: usize,
}

enum Step {
    Advanced,
    Skipped,
}

pub struct Poller<'a> {
    db: &'a Database,
    config: &'a Config,
}

impl<'a> Poller<'a> {
    pub fn new(db: &'a Database, config: &'a Config) -> Self {
        Self { db, config }
    }

    /// Sweeps all non-deleted jobs at a location, highest priority first.
    ///
    /// A failure on one job never stops the sweep: the job is moved to
    /// Error with the failure message and the sweep continues.
    pub fn poll(&self, location: &str) -> Result<PollSummary, StoreError> {
        let query = JobQuery {
            location: Some(location.to_string()),
            prioritize: true,
            sort: true,
            ..JobQuery::default()
        };
        let jobs = find_jobs(self.db, &query)?;
        log::info!("Polling {} jobs at {}", jobs.len(), location);

        let mut summary = PollSummary::default();
        for job in jobs {
            match self.poll_job(&job) {
                Ok(Step::Advanced) => summary.advanced += 1,
                Ok(Step::Skipped) => summary.skipped += 1,
                Err(e) => {
                    log::error!("Job {} failed while polling: {}", job.id, e);
                    let message = format!("Polling failed: {}", e);
                    if let Err(e) = change_state(self.db, job.id, JobState::Error, &message, None)
                    {
                        log::error!("Could not mark job {} as errored: {}", job.id, e);
                    }
                    summary.errored += 1;
                }
            }
        }

        log::info!(
            "Poll of {} finished: {} advanced, {} skipped, {} errored",
            location,
            summary.advanced,
            summary.skipped,
            summary.errored
        );
        Ok(summary)
    }

    fn poll_job(&self, job: &JobRecord) -> Result<Step, StoreError> {
        match job.state {
            JobState::Unknown => self.validate(job),
            JobState::Queued => self.resolve(job),
            JobState::Processed => self.route_processed(job),
            // Fetch/run/transfer/ingest states belong to their worker
            // processes; terminal and Error states are manual.
            _ => Ok(Step::Skipped),
        }
    }

    /// Unknown → Queued when the definition is sound, Error otherwise.
    fn validate(&self, job: &JobRecord) -> Result<Step, StoreError> {
        let has_inputs = match file_repo::get_input_files(self.db, job.id) {
            Ok(_) => true,
            Err(e) if e.is_no_rows() => false,
            Err(e) => return Err(e),
        };
        let has_parents = match graph_repo::get_parents(self.db, job.id) {
            Ok(_) => true,
            Err(e) if e.is_no_rows() => false,
            Err(e) => return Err(e),
        };

        let (target, message) = if !ALLOWED_MODES.contains(&job.mode.as_str()) {
            (
                JobState::Error,
                format!("Job mode '{}' is not one of the allowed modes", job.mode),
            )
        } else if has_inputs || has_parents {
            (JobState::Queued, "Definition validated".to_string())
        } else {
            (
                JobState::Error,
                "Job has neither input files nor parent jobs".to_string(),
            )
        };

        self.step(job, target, &message, JobState::Unknown)
    }

    /// Queued → Waiting once every input is available; Missing when a file
    /// is absent from this site; untouched while a parent is still working.
    fn resolve(&self, job: &JobRecord) -> Result<Step, StoreError> {
        match effective_inputs(self.db, self.config, job.id)? {
            Readiness::Ready(paths) => self.step(
                job,
                JobState::Waiting,
                &format!("{} input files resolved", paths.len()),
                JobState::Queued,
            ),
            Readiness::NotReady(NotReadyReason::NotAtSite { filename }) => self.step(
                job,
                JobState::Missing,
                &format!("Input file '{}' is not at this site", filename),
                JobState::Queued,
            ),
            Readiness::NotReady(reason @ NotReadyReason::ParentNotReady { .. }) => {
                log::debug!("Job {} stays queued: {}", job.id, reason);
                Ok(Step::Skipped)
            }
        }
    }

    /// Processed → Transferring when the task forwards outputs to the
    /// transfer agent, Complete otherwise.
    fn route_processed(&self, job: &JobRecord) -> Result<Step, StoreError> {
        let etransfer = match task_repo::get_task_info(self.db, &job.task) {
            Ok(info) => info.etransfer,
            Err(e) if e.is_no_rows() => {
                log::warn!(
                    "Job {} has unregistered task '{}'; assuming no transfer",
                    job.id,
                    job.task
                );
                false
            }
            Err(e) => return Err(e),
        };

        if etransfer {
            self.step(
                job,
                JobState::Transferring,
                "Outputs queued for transfer",
                JobState::Processed,
            )
        } else {
            self.step(job, JobState::Complete, "Job complete", JobState::Processed)
        }
    }

    fn step(
        &self,
        job: &JobRecord,
        target: JobState,
        message: &str,
        expect: JobState,
    ) -> Result<Step, StoreError> {
        match change_state(self.db, job.id, target, message, Some(expect))? {
            TransitionOutcome::Applied { .. } => {
                log::debug!("Job {}: {} -> {}", job.id, expect, target);
                Ok(Step::Advanced)
            }
            TransitionOutcome::Conflict => {
                log::debug!("Job {} moved concurrently; skipping", job.id);
                Ok(Step::Skipped)
            }
        }
    }
}
