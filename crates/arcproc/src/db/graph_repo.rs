//! Parent/child dependency graph, tile membership and observation metadata.
//!
//! A parent edge means the child consumes the parent's output files that
//! match the edge's regular-expression filter. A job may never be its own
//! parent; that is checked on every mutation. Cycles among distinct jobs
//! are a deployment error and are not detected here.

use rusqlite::{params, Connection};

use super::error::StoreError;
use super::Database;
use crate::state::JobState;

/// A parent edge as stored: parent job id plus output-filename filter.
pub type ParentEdge = (i64, String);

/// One observation metadata attribute. Values are opaque to the core;
/// they exist to be filtered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObsInfo {
    pub keyword: String,
    pub value: String,
}

fn check_not_self_parent(job_id: i64, parents: &[ParentEdge]) -> Result<(), StoreError> {
    if parents.iter().any(|(parent, _)| *parent == job_id) {
        return Err(StoreError::InvalidArgument(format!(
            "job {} cannot be its own parent",
            job_id
        )));
    }
    Ok(())
}

pub(crate) fn insert_parents(
    conn: &Connection,
    job_id: i64,
    parents: &[ParentEdge],
) -> Result<(), StoreError> {
    check_not_self_parent(job_id, parents)?;
    for (parent, filter) in parents {
        conn.execute(
            "INSERT INTO parent (job_id, parent, filter) VALUES (?1, ?2, ?3)",
            params![job_id, parent, filter],
        )?;
    }
    Ok(())
}

pub(crate) fn replace_parents_inner(
    conn: &Connection,
    job_id: i64,
    parents: &[ParentEdge],
) -> Result<(), StoreError> {
    check_not_self_parent(job_id, parents)?;
    conn.execute("DELETE FROM parent WHERE job_id = ?1", params![job_id])?;
    insert_parents(conn, job_id, parents)
}

/// Returns the (parent, filter) edges of a job.
pub fn get_parents(db: &Database, job_id: i64) -> Result<Vec<ParentEdge>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT parent, filter FROM parent WHERE job_id = ?1 ORDER BY parent")?;
        let parents: Vec<ParentEdge> = stmt
            .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<_, _>>()?;
        if parents.is_empty() {
            return Err(StoreError::NoRows {
                table: "parent",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(parents)
    })
}

/// Returns the parent edges together with each parent's current state,
/// for readiness classification.
pub fn get_parents_with_state(
    db: &Database,
    job_id: i64,
) -> Result<Vec<(i64, String, JobState)>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT parent.parent, parent.filter, job.state
             FROM parent JOIN job ON job.id = parent.parent
             WHERE parent.job_id = ?1 ORDER BY parent.parent",
        )?;
        let parents: Vec<(i64, String, JobState)> = stmt
            .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<_, _>>()?;
        if parents.is_empty() {
            return Err(StoreError::NoRows {
                table: "parent",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(parents)
    })
}

/// Returns the ids of jobs that depend on the given job.
pub fn get_children(db: &Database, job_id: i64) -> Result<Vec<i64>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT job_id FROM parent WHERE parent = ?1 ORDER BY job_id")?;
        let children: Vec<i64> = stmt
            .query_map(params![job_id], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        if children.is_empty() {
            return Err(StoreError::NoRows {
                table: "parent",
                query: format!("parent = {}", job_id),
            });
        }
        Ok(children)
    })
}

/// Adds edges to a job's existing parent list.
pub fn add_to_parents(
    db: &Database,
    job_id: i64,
    parents: &[ParentEdge],
) -> Result<(), StoreError> {
    db.with_txn(|txn| insert_parents(txn, job_id, parents))
}

/// Atomically replaces a job's parent list (delete-all + insert-all).
pub fn replace_parents(
    db: &Database,
    job_id: i64,
    parents: &[ParentEdge],
) -> Result<(), StoreError> {
    db.with_txn(|txn| replace_parents_inner(txn, job_id, parents))
}

/// Removes the given parents from a job.
pub fn delete_parents(db: &Database, job_id: i64, parents: &[i64]) -> Result<(), StoreError> {
    db.with_txn(|txn| {
        for parent in parents {
            txn.execute(
                "DELETE FROM parent WHERE job_id = ?1 AND parent = ?2",
                params![job_id, parent],
            )?;
        }
        Ok(())
    })
}

pub(crate) fn replace_tiles(
    conn: &Connection,
    job_id: i64,
    tiles: &[i64],
) -> Result<(), StoreError> {
    conn.execute("DELETE FROM tile WHERE job_id = ?1", params![job_id])?;
    for tile in tiles {
        conn.execute(
            "INSERT INTO tile (job_id, tile) VALUES (?1, ?2)",
            params![job_id, tile],
        )?;
    }
    Ok(())
}

/// Returns the tiles a job contributes to.
pub fn get_tilelist(db: &Database, job_id: i64) -> Result<Vec<i64>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT tile FROM tile WHERE job_id = ?1 ORDER BY tile")?;
        let tiles: Vec<i64> = stmt
            .query_map(params![job_id], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        if tiles.is_empty() {
            return Err(StoreError::NoRows {
                table: "tile",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(tiles)
    })
}

/// Replaces a job's tile list.
pub fn set_tilelist(db: &Database, job_id: i64, tiles: &[i64]) -> Result<(), StoreError> {
    db.with_txn(|txn| replace_tiles(txn, job_id, tiles))
}

pub(crate) fn replace_obs_info(
    conn: &Connection,
    job_id: i64,
    obs: &[ObsInfo],
) -> Result<(), StoreError> {
    conn.execute("DELETE FROM obs WHERE job_id = ?1", params![job_id])?;
    for entry in obs {
        conn.execute(
            "INSERT INTO obs (job_id, keyword, value) VALUES (?1, ?2, ?3)",
            params![job_id, entry.keyword, entry.value],
        )?;
    }
    Ok(())
}

/// Returns a job's observation metadata attributes.
pub fn get_obs_info(db: &Database, job_id: i64) -> Result<Vec<ObsInfo>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT keyword, value FROM obs WHERE job_id = ?1 ORDER BY keyword")?;
        let obs: Vec<ObsInfo> = stmt
            .query_map(params![job_id], |r| {
                Ok(ObsInfo {
                    keyword: r.get(0)?,
                    value: r.get(1)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        if obs.is_empty() {
            return Err(StoreError::NoRows {
                table: "obs",
                query: format!("job_id = {}", job_id),
            });
        }
        Ok(obs)
    })
}

/// Replaces a job's observation metadata.
pub fn set_obs_info(db: &Database, job_id: i64, obs: &[ObsInfo]) -> Result<(), StoreError> {
    db.with_txn(|txn| replace_obs_info(txn, job_id, obs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_store::{add_job, AddJob};

    fn file_job(db: &Database, tag: &str) -> i64 {
        let mut add = AddJob::new(tag, "SITE-A", "obs", "reduce");
        add.input_files = vec![format!("{}_raw.sdf", tag)];
        add_job(db, &add).unwrap()
    }

    fn test_db() -> (Database, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = file_job(&db, "parent-a");
        let b = file_job(&db, "parent-b");

        let mut add = AddJob::new("child", "SITE-A", "night", "coadd");
        add.parents = vec![(a, r".*\.fits".to_string()), (b, r".*\.fits".to_string())];
        let child = add_job(&db, &add).unwrap();

        (db, a, b, child)
    }

    #[test]
    fn test_get_parents_and_children() {
        let (db, a, b, child) = test_db();

        let parents = get_parents(&db, child).unwrap();
        assert_eq!(parents.len(), 2);
        assert!(parents.contains(&(a, r".*\.fits".to_string())));

        assert_eq!(get_children(&db, a).unwrap(), vec![child]);
        assert_eq!(get_children(&db, b).unwrap(), vec![child]);
        assert!(get_children(&db, child).unwrap_err().is_no_rows());
    }

    #[test]
    fn test_parents_with_state() {
        let (db, a, _, child) = test_db();
        let parents = get_parents_with_state(&db, child).unwrap();
        let entry = parents.iter().find(|(id, _, _)| *id == a).unwrap();
        assert_eq!(entry.2, JobState::Unknown);
    }

    #[test]
    fn test_replace_parents_is_atomic_swap() {
        let (db, a, _, child) = test_db();
        replace_parents(&db, child, &[(a, r".*\.png".to_string())]).unwrap();
        assert_eq!(
            get_parents(&db, child).unwrap(),
            vec![(a, r".*\.png".to_string())]
        );
    }

    #[test]
    fn test_delete_parents() {
        let (db, a, b, child) = test_db();
        delete_parents(&db, child, &[a]).unwrap();
        assert_eq!(
            get_parents(&db, child).unwrap(),
            vec![(b, r".*\.fits".to_string())]
        );
    }

    #[test]
    fn test_self_parent_rejected_everywhere() {
        let (db, a, _, child) = test_db();

        let self_edge = vec![(child, String::new())];
        assert!(matches!(
            add_to_parents(&db, child, &self_edge),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            replace_parents(&db, child, &self_edge),
            Err(StoreError::InvalidArgument(_))
        ));

        // A failed replace must not have dropped the existing edges.
        let parents = get_parents(&db, child).unwrap();
        assert_eq!(parents.len(), 2);
        assert!(parents.iter().any(|(id, _)| *id == a));
    }

    #[test]
    fn test_tilelist_round_trip() {
        let (db, a, _, _) = test_db();
        assert!(get_tilelist(&db, a).unwrap_err().is_no_rows());
        set_tilelist(&db, a, &[101, 102, 103]).unwrap();
        assert_eq!(get_tilelist(&db, a).unwrap(), vec![101, 102, 103]);
        set_tilelist(&db, a, &[104]).unwrap();
        assert_eq!(get_tilelist(&db, a).unwrap(), vec![104]);
    }

    #[test]
    fn test_obs_info_round_trip() {
        let (db, a, _, _) = test_db();
        let obs = vec![
            ObsInfo {
                keyword: "instrument".to_string(),
                value: "SCUBA-2".to_string(),
            },
            ObsInfo {
                keyword: "obstype".to_string(),
                value: "science".to_string(),
            },
        ];
        set_obs_info(&db, a, &obs).unwrap();
        assert_eq!(get_obs_info(&db, a).unwrap(), obs);
    }
}
