//! Per-task configuration: whether a task's output proceeds to transfer.

use rusqlite::{params, Row};

use super::error::StoreError;
use super::Database;

/// Configuration row for one processing task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: i64,
    pub taskname: String,
    /// Output of this task is forwarded to the transfer agent when true;
    /// otherwise processed jobs complete directly.
    pub etransfer: bool,
}

impl TaskInfo {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            taskname: row.get("taskname")?,
            etransfer: row.get("etransfer")?,
        })
    }
}

/// Registers a task. Fails on duplicate task names.
pub fn add_task(db: &Database, taskname: &str, etransfer: bool) -> Result<i64, StoreError> {
    db.with_txn(|txn| {
        let count: u32 = txn.query_row(
            "SELECT COUNT(*) FROM task WHERE taskname = ?1",
            params![taskname],
            |r| r.get(0),
        )?;
        if count > 0 {
            return Err(StoreError::InvalidArgument(format!(
                "task '{}' already exists",
                taskname
            )));
        }
        txn.execute(
            "INSERT INTO task (taskname, etransfer) VALUES (?1, ?2)",
            params![taskname, etransfer],
        )?;
        Ok(txn.last_insert_rowid())
    })
}

/// Looks up a task's configuration by name.
pub fn get_task_info(db: &Database, taskname: &str) -> Result<TaskInfo, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM task WHERE taskname = ?1")?;
        let rows: Vec<TaskInfo> = stmt
            .query_map(params![taskname], TaskInfo::from_row)?
            .collect::<Result<_, _>>()?;
        match rows.len() {
            0 => Err(StoreError::NoRows {
                table: "task",
                query: format!("taskname = '{}'", taskname),
            }),
            1 => Ok(rows.into_iter().next().expect("checked length")),
            _ => Err(StoreError::ExcessRows {
                table: "task",
                query: format!("taskname = '{}'", taskname),
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get_task() {
        let db = Database::open_in_memory().unwrap();
        add_task(&db, "reduce", true).unwrap();

        let info = get_task_info(&db, "reduce").unwrap();
        assert_eq!(info.taskname, "reduce");
        assert!(info.etransfer);
    }

    #[test]
    fn test_missing_task_is_no_rows() {
        let db = Database::open_in_memory().unwrap();
        assert!(get_task_info(&db, "nope").unwrap_err().is_no_rows());
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let db = Database::open_in_memory().unwrap();
        add_task(&db, "reduce", false).unwrap();
        assert!(matches!(
            add_task(&db, "reduce", true),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
