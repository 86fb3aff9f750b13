//! Operator-facing bulk operations.

use crate::db::error::StoreError;
use crate::db::job_store::{change_state, find_jobs, JobQuery, TransitionOutcome};
use crate::db::log_repo::set_qa_state;
use crate::db::Database;
use crate::state::{JobState, QaState};

/// Counters from a bulk reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub reset: usize,
    pub skipped: usize,
}

/// Resets every job matching the query back to Unknown for reprocessing.
///
/// Active jobs are left alone: a worker owns them and yanking the state
/// out from under it would orphan the work. Each reset is guarded on the
/// state observed during the listing, so jobs that move concurrently are
/// skipped rather than clobbered.
pub fn reset_jobs(
    db: &Database,
    query: &JobQuery,
    message: &str,
) -> Result<ResetSummary, StoreError> {
    let jobs = find_jobs(db, query)?;
    let mut summary = ResetSummary::default();

    for job in jobs {
        if job.state.info().active {
            log::debug!("Job {} is active ({}); not reset", job.id, job.state);
            summary.skipped += 1;
            continue;
        }
        match change_state(db, job.id, JobState::Unknown, message, Some(job.state))? {
            TransitionOutcome::Applied { .. } => summary.reset += 1,
            TransitionOutcome::Conflict => summary.skipped += 1,
        }
    }

    log::info!(
        "Reset {} jobs ({} skipped): {}",
        summary.reset,
        summary.skipped,
        message
    );
    Ok(summary)
}

/// Records an operator's quality assessment of a job's outputs.
pub fn annotate_qa(
    db: &Database,
    job_id: i64,
    status: QaState,
    message: &str,
    username: &str,
) -> Result<(), StoreError> {
    set_qa_state(db, job_id, status, message, username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_store::{add_job, get_job, AddJob};

    fn job_in_state(db: &Database, tag: &str, state: JobState) -> i64 {
        let mut add = AddJob::new(tag, "SITE-A", "obs", "reduce");
        add.input_files = vec![format!("{}.sdf", tag)];
        let job_id = add_job(db, &add).unwrap();
        if state != JobState::Unknown {
            change_state(db, job_id, state, "setup", None).unwrap();
        }
        job_id
    }

    #[test]
    fn test_reset_skips_active_jobs() {
        let db = Database::open_in_memory().unwrap();
        let errored = job_in_state(&db, "err", JobState::Error);
        let done = job_in_state(&db, "done", JobState::Complete);
        let running = job_in_state(&db, "run", JobState::Running);

        let summary = reset_jobs(&db, &JobQuery::default(), "bulk reprocess").unwrap();
        assert_eq!(summary, ResetSummary { reset: 2, skipped: 1 });

        assert_eq!(get_job(&db, errored).unwrap().state, JobState::Unknown);
        assert_eq!(get_job(&db, done).unwrap().state, JobState::Unknown);
        assert_eq!(get_job(&db, running).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_reset_honours_query_filters() {
        let db = Database::open_in_memory().unwrap();
        let errored = job_in_state(&db, "err", JobState::Error);
        let done = job_in_state(&db, "done", JobState::Complete);

        let query = JobQuery::in_state(JobState::Error);
        let summary = reset_jobs(&db, &query, "retry failures").unwrap();
        assert_eq!(summary.reset, 1);
        assert_eq!(get_job(&db, errored).unwrap().state, JobState::Unknown);
        assert_eq!(get_job(&db, done).unwrap().state, JobState::Complete);
    }

    #[test]
    fn test_annotate_qa() {
        let db = Database::open_in_memory().unwrap();
        let job_id = job_in_state(&db, "qa", JobState::Complete);
        annotate_qa(&db, job_id, QaState::Questionable, "noisy map", "op").unwrap();
        assert_eq!(
            get_job(&db, job_id).unwrap().qa_state,
            QaState::Questionable
        );
    }

    #[test]
    fn test_reset_resets_unknown_too() {
        let db = Database::open_in_memory().unwrap();
        let fresh = job_in_state(&db, "fresh", JobState::Unknown);
        let summary = reset_jobs(&db, &JobQuery::default(), "sweep").unwrap();
        assert_eq!(summary.reset, 1);
        assert_eq!(get_job(&db, fresh).unwrap().state, JobState::Unknown);
    }
}
