//! Audit trail repositories: the per-job `log` and `qa` tables.
//!
//! Both tables are append-only. Ordering is by row id, which is monotonic
//! per unit of work; wall-clock timestamps from different workers are not
//! assumed comparable.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};

use super::error::StoreError;
use super::Database;
use crate::state::{JobState, QaState};

/// One state-transition audit record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub job_id: i64,
    pub datetime: String,
    pub state_prev: JobState,
    pub state_new: JobState,
    pub message: String,
    pub host: String,
    pub username: String,
}

impl LogEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            datetime: row.get("datetime")?,
            state_prev: row.get("state_prev")?,
            state_new: row.get("state_new")?,
            message: row.get("message")?,
            host: row.get("host")?,
            username: row.get("username")?,
        })
    }
}

/// One QA-change audit record.
#[derive(Debug, Clone)]
pub struct QaEntry {
    pub id: i64,
    pub job_id: i64,
    pub datetime: String,
    pub status: QaState,
    pub message: String,
    pub username: String,
}

impl QaEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            datetime: row.get("datetime")?,
            status: row.get("status")?,
            message: row.get("message")?,
            username: row.get("username")?,
        })
    }
}

/// Timestamp written into audit rows.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Host/user identity recorded with each transition.
pub(crate) fn identity() -> (String, String) {
    let host = std::env::var("HOSTNAME").unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    (host, user)
}

/// Appends a log row inside an already-open unit of work.
pub(crate) fn append_log(
    conn: &Connection,
    job_id: i64,
    state_prev: JobState,
    state_new: JobState,
    message: &str,
) -> Result<(), StoreError> {
    let (host, username) = identity();
    conn.execute(
        "INSERT INTO log (job_id, datetime, state_prev, state_new, message, host, username)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            job_id,
            now_timestamp(),
            state_prev,
            state_new,
            message,
            host,
            username
        ],
    )?;
    Ok(())
}

/// Appends a qa row inside an already-open unit of work.
pub(crate) fn append_qa(
    conn: &Connection,
    job_id: i64,
    status: QaState,
    message: &str,
    username: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO qa (job_id, datetime, status, message, username)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, now_timestamp(), status, message, username],
    )?;
    Ok(())
}

/// Returns all log entries for a job, oldest first.
pub fn get_logs(db: &Database, job_id: i64) -> Result<Vec<LogEntry>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM log WHERE job_id = ?1 ORDER BY id ASC")?;
        let logs: Vec<LogEntry> = stmt
            .query_map(params![job_id], LogEntry::from_row)?
            .collect::<Result<_, _>>()?;
        if logs.is_empty() {
            return Err(StoreError::NoRows {
                table: "log",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(logs)
    })
}

/// Returns the most recent log entry for a job.
pub fn get_last_log(db: &Database, job_id: i64) -> Result<LogEntry, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM log WHERE job_id = ?1 ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query_map(params![job_id], LogEntry::from_row)?;
        match rows.next() {
            Some(entry) => Ok(entry?),
            None => Err(StoreError::NoRows {
                table: "log",
                query: format!("job_id = {}", job_id),
            }),
        }
    })
}

/// Counts how many times a job has entered the given state, from the log.
///
/// Used for the bounded missing-input retry policy: a retry counter is
/// derived from the audit trail rather than a dedicated column.
pub fn count_state_visits(
    db: &Database,
    job_id: i64,
    state: JobState,
) -> Result<u64, StoreError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM log WHERE job_id = ?1 AND state_new = ?2",
            params![job_id, state],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Returns all QA entries for a job, oldest first.
pub fn get_qa_logs(db: &Database, job_id: i64) -> Result<Vec<QaEntry>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM qa WHERE job_id = ?1 ORDER BY id ASC")?;
        let entries: Vec<QaEntry> = stmt
            .query_map(params![job_id], QaEntry::from_row)?
            .collect::<Result<_, _>>()?;
        if entries.is_empty() {
            return Err(StoreError::NoRows {
                table: "qa",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(entries)
    })
}

/// Sets a job's QA state and appends the matching qa audit row in one
/// unit of work.
pub fn set_qa_state(
    db: &Database,
    job_id: i64,
    status: QaState,
    message: &str,
    username: &str,
) -> Result<(), StoreError> {
    db.with_txn(|txn| {
        let n = txn.execute(
            "UPDATE job SET qa_state = ?1 WHERE id = ?2",
            params![status, job_id],
        )?;
        match n {
            0 => Err(StoreError::NoRows {
                table: "job",
                query: format!("id = {}", job_id),
            }),
            1 => append_qa(txn, job_id, status, message, username),
            _ => Err(StoreError::ExcessRows {
                table: "job",
                query: format!("id = {}", job_id),
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_store::{add_job, get_job, AddJob};

    fn test_db_with_job() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let mut add = AddJob::new("tag-1", "SITE-A", "obs", "reduce");
        add.input_files = vec!["raw_0001.sdf".to_string()];
        let job_id = add_job(&db, &add).unwrap();
        (db, job_id)
    }

    #[test]
    fn test_initial_log_entry() {
        let (db, job_id) = test_db_with_job();
        let logs = get_logs(&db, job_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].job_id, job_id);
        assert_eq!(logs[0].state_new, JobState::Unknown);
    }

    #[test]
    fn test_no_logs_is_no_rows() {
        let (db, _) = test_db_with_job();
        let err = get_logs(&db, 999).unwrap_err();
        assert!(err.is_no_rows());
        let err = get_last_log(&db, 999).unwrap_err();
        assert!(err.is_no_rows());
    }

    #[test]
    fn test_count_state_visits() {
        let (db, job_id) = test_db_with_job();
        assert_eq!(count_state_visits(&db, job_id, JobState::Unknown).unwrap(), 1);
        assert_eq!(count_state_visits(&db, job_id, JobState::Missing).unwrap(), 0);
    }

    #[test]
    fn test_set_qa_state() {
        let (db, job_id) = test_db_with_job();
        set_qa_state(&db, job_id, QaState::Bad, "bad baseline", "operator").unwrap();

        let job = get_job(&db, job_id).unwrap();
        assert_eq!(job.qa_state, QaState::Bad);

        let entries = get_qa_logs(&db, job_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, QaState::Bad);
        assert_eq!(entries[0].username, "operator");
    }

    #[test]
    fn test_set_qa_state_missing_job() {
        let (db, _) = test_db_with_job();
        let err = set_qa_state(&db, 999, QaState::Good, "msg", "op").unwrap_err();
        assert!(err.is_no_rows());
    }
}
