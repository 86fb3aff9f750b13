//! Input and output file repositories.
//!
//! Both lists are full-replacement: setters delete all rows for the job
//! and insert the new list in one unit of work. Getters report absence of
//! rows as `NoRows` rather than an empty collection, so callers can tell
//! "no files recorded yet" from "recorded as zero files" at the job level.

use rusqlite::{params, Connection, Row};

use super::error::StoreError;
use super::Database;

/// An output file with its content hash as reported by the run action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub filename: String,
    pub md5: Option<String>,
}

impl OutputFile {
    pub fn new(filename: &str, md5: Option<&str>) -> Self {
        Self {
            filename: filename.to_string(),
            md5: md5.map(str::to_string),
        }
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            filename: row.get("filename")?,
            md5: row.get("md5")?,
        })
    }
}

fn check_job_exists(conn: &Connection, job_id: i64) -> Result<(), StoreError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM job WHERE id = ?1",
        params![job_id],
        |r| r.get(0),
    )?;
    if count == 0 {
        return Err(StoreError::NoRows {
            table: "job",
            query: format!("id = {}", job_id),
        });
    }
    Ok(())
}

pub(crate) fn insert_input_files(
    conn: &Connection,
    job_id: i64,
    filenames: &[String],
) -> Result<(), StoreError> {
    for filename in filenames {
        conn.execute(
            "INSERT INTO input_file (job_id, filename) VALUES (?1, ?2)",
            params![job_id, filename],
        )?;
    }
    Ok(())
}

pub(crate) fn replace_input_files(
    conn: &Connection,
    job_id: i64,
    filenames: &[String],
) -> Result<(), StoreError> {
    conn.execute("DELETE FROM input_file WHERE job_id = ?1", params![job_id])?;
    insert_input_files(conn, job_id, filenames)
}

/// Returns the registered input files for a job.
pub fn get_input_files(db: &Database, job_id: i64) -> Result<Vec<String>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT filename FROM input_file WHERE job_id = ?1 ORDER BY id")?;
        let files: Vec<String> = stmt
            .query_map(params![job_id], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        if files.is_empty() {
            return Err(StoreError::NoRows {
                table: "input_file",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(files)
    })
}

/// Replaces the input file list for a job.
pub fn set_input_files(
    db: &Database,
    job_id: i64,
    filenames: &[String],
) -> Result<(), StoreError> {
    db.with_txn(|txn| {
        check_job_exists(txn, job_id)?;
        replace_input_files(txn, job_id, filenames)
    })
}

/// Returns the recorded output files for a job.
pub fn get_output_files(db: &Database, job_id: i64) -> Result<Vec<OutputFile>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT filename, md5 FROM output_file WHERE job_id = ?1 ORDER BY id")?;
        let files: Vec<OutputFile> = stmt
            .query_map(params![job_id], OutputFile::from_row)?
            .collect::<Result<_, _>>()?;
        if files.is_empty() {
            return Err(StoreError::NoRows {
                table: "output_file",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(files)
    })
}

/// Replaces the output file list for a job (delete-then-insert, never
/// incrementally patched).
pub fn set_output_files(
    db: &Database,
    job_id: i64,
    files: &[OutputFile],
) -> Result<(), StoreError> {
    db.with_txn(|txn| {
        check_job_exists(txn, job_id)?;
        txn.execute("DELETE FROM output_file WHERE job_id = ?1", params![job_id])?;
        for file in files {
            txn.execute(
                "INSERT INTO output_file (job_id, filename, md5) VALUES (?1, ?2, ?3)",
                params![job_id, file.filename, file.md5],
            )?;
        }
        Ok(())
    })
}
