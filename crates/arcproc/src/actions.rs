//! The contract surface for external worker processes.
//!
//! Fetchers, runners, transfer and ingest agents live outside this crate;
//! they interact with the store only through these helpers. Every
//! ownership change goes through a guarded transition, so two workers can
//! never both believe they own a job.

use crate::db::error::StoreError;
use crate::db::file_repo::{set_output_files, OutputFile};
use crate::db::job_store::{change_state, TransitionOutcome};
use crate::db::log_repo::count_state_visits;
use crate::db::Database;
use crate::state::JobState;

/// Attempts to claim a job for a worker by moving it `from` → `to`.
/// Returns false when the job was claimed or moved by someone else first.
pub fn claim(
    db: &Database,
    job_id: i64,
    from: JobState,
    to: JobState,
    message: &str,
) -> Result<bool, StoreError> {
    let outcome = change_state(db, job_id, to, message, Some(from))?;
    Ok(outcome.applied())
}

/// Records a worker failure: the job moves to Error unconditionally so the
/// reason is never lost, even if the state drifted meanwhile.
pub fn report_error(db: &Database, job_id: i64, message: &str) -> Result<(), StoreError> {
    change_state(db, job_id, JobState::Error, message, None)?;
    Ok(())
}

/// Records a successful run: stores the output file list and moves the job
/// Running → Processed. Returns false when the job was no longer Running.
pub fn report_processed(
    db: &Database,
    job_id: i64,
    outputs: &[OutputFile],
) -> Result<bool, StoreError> {
    set_output_files(db, job_id, outputs)?;
    let outcome = change_state(
        db,
        job_id,
        JobState::Processed,
        &format!("Run produced {} output files", outputs.len()),
        Some(JobState::Running),
    )?;
    Ok(outcome.applied())
}

/// Reports that a running job's input data turned out to be unavailable.
///
/// The job goes back to Missing so a later fetch can retry, but only
/// `retry_limit` times: the retry count is derived from the audit log, and
/// once exhausted the job moves to Error instead. Returns the state the
/// job was moved to, or `None` when the job was no longer Running.
pub fn report_missing_input(
    db: &Database,
    job_id: i64,
    retry_limit: u64,
) -> Result<Option<JobState>, StoreError> {
    let visits = count_state_visits(db, job_id, JobState::Missing)?;

    let (target, message) = if visits >= retry_limit {
        (
            JobState::Error,
            format!("Input data unavailable after {} retries", visits),
        )
    } else {
        (
            JobState::Missing,
            format!("Input data unavailable (attempt {})", visits + 1),
        )
    };

    match change_state(db, job_id, target, &message, Some(JobState::Running))? {
        TransitionOutcome::Applied { .. } => Ok(Some(target)),
        TransitionOutcome::Conflict => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::file_repo::get_output_files;
    use crate::db::job_store::{add_job, get_job, AddJob};

    fn running_job(db: &Database, tag: &str) -> i64 {
        let mut add = AddJob::new(tag, "SITE-A", "obs", "reduce");
        add.input_files = vec![format!("{}.sdf", tag)];
        let job_id = add_job(db, &add).unwrap();
        change_state(db, job_id, JobState::Running, "claimed", None).unwrap();
        job_id
    }

    #[test]
    fn test_claim() {
        let db = Database::open_in_memory().unwrap();
        let mut add = AddJob::new("c", "SITE-A", "obs", "reduce");
        add.input_files = vec!["c.sdf".to_string()];
        let job_id = add_job(&db, &add).unwrap();
        change_state(&db, job_id, JobState::Waiting, "staged", None).unwrap();

        assert!(claim(&db, job_id, JobState::Waiting, JobState::Running, "runner 1").unwrap());
        assert!(!claim(&db, job_id, JobState::Waiting, JobState::Running, "runner 2").unwrap());
        assert_eq!(get_job(&db, job_id).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_report_processed() {
        let db = Database::open_in_memory().unwrap();
        let job_id = running_job(&db, "p");

        let outputs = vec![OutputFile::new("map.fits", Some("abc123"))];
        assert!(report_processed(&db, job_id, &outputs).unwrap());
        assert_eq!(get_job(&db, job_id).unwrap().state, JobState::Processed);
        assert_eq!(get_output_files(&db, job_id).unwrap(), outputs);
    }

    #[test]
    fn test_report_error() {
        let db = Database::open_in_memory().unwrap();
        let job_id = running_job(&db, "e");
        report_error(&db, job_id, "reduction crashed").unwrap();
        assert_eq!(get_job(&db, job_id).unwrap().state, JobState::Error);
    }

    #[test]
    fn test_missing_input_bounded_retry() {
        let db = Database::open_in_memory().unwrap();
        let job_id = running_job(&db, "m");

        // Two retries allowed, third attempt fails the job.
        assert_eq!(
            report_missing_input(&db, job_id, 2).unwrap(),
            Some(JobState::Missing)
        );
        change_state(&db, job_id, JobState::Running, "retried", None).unwrap();
        assert_eq!(
            report_missing_input(&db, job_id, 2).unwrap(),
            Some(JobState::Missing)
        );
        change_state(&db, job_id, JobState::Running, "retried", None).unwrap();
        assert_eq!(
            report_missing_input(&db, job_id, 2).unwrap(),
            Some(JobState::Error)
        );
        assert_eq!(get_job(&db, job_id).unwrap().state, JobState::Error);
    }

    #[test]
    fn test_missing_input_requires_running() {
        let db = Database::open_in_memory().unwrap();
        let mut add = AddJob::new("n", "SITE-A", "obs", "reduce");
        add.input_files = vec!["n.sdf".to_string()];
        let job_id = add_job(&db, &add).unwrap();

        assert_eq!(report_missing_input(&db, job_id, 2).unwrap(), None);
        assert_eq!(get_job(&db, job_id).unwrap().state, JobState::Unknown);
    }
}
