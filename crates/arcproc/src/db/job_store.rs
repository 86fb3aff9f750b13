//! Job repository: creation, lookup, the guarded state-transition
//! primitive and priority-ordered selection.
//!
//! `change_state` is the only cross-process coordination primitive in the
//! system: workers discover candidates with `find_jobs` (a plain read) and
//! then race to claim them with a guarded transition. Losing that race is
//! a normal outcome, reported as [`TransitionOutcome::Conflict`], never as
//! an error.

use rusqlite::{params, Connection, Row};

use super::constraint::{Constraint, ConstraintQuery, Predicate, Value};
use super::error::StoreError;
use super::{file_repo, graph_repo, log_repo, Database};
use crate::db::graph_repo::{ObsInfo, ParentEdge};
use crate::state::{JobState, QaState};

/// Processing modes accepted by the run action. The values stay opaque to
/// the core; only membership is validated.
pub const ALLOWED_MODES: [&str; 4] = ["obs", "night", "project", "public"];

const JOB_COLUMNS: &str =
    "id, tag, state, state_prev, location, mode, parameters, task, priority, qa_state, foreign_id";

/// A job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub tag: String,
    pub state: JobState,
    pub state_prev: JobState,
    pub location: String,
    pub mode: String,
    pub parameters: String,
    pub task: String,
    pub priority: i32,
    pub qa_state: QaState,
    pub foreign_id: Option<String>,
}

impl JobRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tag: row.get("tag")?,
            state: row.get("state")?,
            state_prev: row.get("state_prev")?,
            location: row.get("location")?,
            mode: row.get("mode")?,
            parameters: row.get("parameters")?,
            task: row.get("task")?,
            priority: row.get("priority")?,
            qa_state: row.get("qa_state")?,
            foreign_id: row.get("foreign_id")?,
        })
    }
}

/// Parameters for registering a new job.
#[derive(Debug, Clone)]
pub struct AddJob {
    pub tag: String,
    pub location: String,
    pub mode: String,
    pub task: String,
    pub parameters: String,
    pub priority: i32,
    pub state: JobState,
    pub input_files: Vec<String>,
    pub parents: Vec<ParentEdge>,
    pub tilelist: Vec<i64>,
    pub obs: Vec<ObsInfo>,
    pub foreign_id: Option<String>,
}

impl AddJob {
    pub fn new(tag: &str, location: &str, mode: &str, task: &str) -> Self {
        Self {
            tag: tag.to_string(),
            location: location.to_string(),
            mode: mode.to_string(),
            task: task.to_string(),
            parameters: String::new(),
            priority: 0,
            state: JobState::Unknown,
            input_files: Vec::new(),
            parents: Vec::new(),
            tilelist: Vec::new(),
            obs: Vec::new(),
            foreign_id: None,
        }
    }
}

/// Result of a guarded state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The conditional update matched and the job moved.
    Applied { state_prev: JobState },
    /// The job was not in the expected state: another worker claimed or
    /// moved it first. A normal race outcome, not a failure.
    Conflict,
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

fn check_mode(mode: &str) -> Result<(), StoreError> {
    if ALLOWED_MODES.contains(&mode) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "mode '{}' is not one of the allowed modes",
            mode
        )))
    }
}

/// Registers a new job with its input files and/or parent edges, writing
/// the initial log entry in the same unit of work.
pub fn add_job(db: &Database, add: &AddJob) -> Result<i64, StoreError> {
    check_mode(&add.mode)?;
    if add.input_files.is_empty() && add.parents.is_empty() {
        return Err(StoreError::InvalidArgument(
            "a job must have input files or parent jobs".to_string(),
        ));
    }

    db.with_txn(|txn| {
        let existing: u32 = txn.query_row(
            "SELECT COUNT(*) FROM job WHERE tag = ?1",
            params![add.tag],
            |r| r.get(0),
        )?;
        if existing > 0 {
            return Err(StoreError::DuplicateTag(add.tag.clone()));
        }

        txn.execute(
            "INSERT INTO job (tag, state, state_prev, location, mode, parameters, task,
             priority, foreign_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                add.tag,
                add.state,
                add.state,
                add.location,
                add.mode,
                add.parameters,
                add.task,
                add.priority,
                add.foreign_id,
            ],
        )?;
        let job_id = txn.last_insert_rowid();

        file_repo::insert_input_files(txn, job_id, &add.input_files)?;
        graph_repo::insert_parents(txn, job_id, &add.parents)?;
        if !add.tilelist.is_empty() {
            graph_repo::replace_tiles(txn, job_id, &add.tilelist)?;
        }
        if !add.obs.is_empty() {
            graph_repo::replace_obs_info(txn, job_id, &add.obs)?;
        }

        log_repo::append_log(
            txn,
            job_id,
            add.state,
            add.state,
            "Job added to the database",
        )?;

        Ok(job_id)
    })
}

fn fetch_one(
    conn: &Connection,
    where_sql: &str,
    param: &dyn rusqlite::ToSql,
    query: String,
) -> Result<JobRecord, StoreError> {
    let sql = format!("SELECT {} FROM job WHERE {}", JOB_COLUMNS, where_sql);
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<JobRecord> = stmt
        .query_map(params![param], JobRecord::from_row)?
        .collect::<Result<_, _>>()?;
    match rows.len() {
        0 => Err(StoreError::NoRows {
            table: "job",
            query,
        }),
        1 => Ok(rows.into_iter().next().expect("checked length")),
        _ => Err(StoreError::ExcessRows {
            table: "job",
            query,
        }),
    }
}

/// Fetches a job by id.
pub fn get_job(db: &Database, job_id: i64) -> Result<JobRecord, StoreError> {
    db.with_conn(|conn| fetch_one(conn, "id = ?1", &job_id, format!("id = {}", job_id)))
}

/// Fetches a job by its unique tag.
pub fn get_job_by_tag(db: &Database, tag: &str) -> Result<JobRecord, StoreError> {
    db.with_conn(|conn| fetch_one(conn, "tag = ?1", &tag, format!("tag = '{}'", tag)))
}

/// The core concurrency primitive: a single conditional update that moves
/// `state` to `state_prev` and installs the new state, optionally guarded
/// on the current state.
///
/// With a guard, zero matched rows means another worker already claimed or
/// moved the job; that is returned as `Conflict` and the caller must treat
/// it as a benign no-op. Without a guard, zero rows means the job does not
/// exist. More than one row violates the id uniqueness invariant.
///
/// On success a log entry is appended in the same unit of work, and when
/// the new state is pre-run the QA state is reset to unknown (with its own
/// qa audit row), so stale QA judgments never survive a reprocess.
pub fn change_state(
    db: &Database,
    job_id: i64,
    new_state: JobState,
    message: &str,
    expect: Option<JobState>,
) -> Result<TransitionOutcome, StoreError> {
    db.with_txn(|txn| {
        let n = match expect {
            Some(required) => txn.execute(
                "UPDATE job SET state_prev = state, state = ?1 WHERE id = ?2 AND state = ?3",
                params![new_state, job_id, required],
            )?,
            None => txn.execute(
                "UPDATE job SET state_prev = state, state = ?1 WHERE id = ?2",
                params![new_state, job_id],
            )?,
        };

        match n {
            0 => {
                if expect.is_some() {
                    Ok(TransitionOutcome::Conflict)
                } else {
                    Err(StoreError::NoRows {
                        table: "job",
                        query: format!("id = {}", job_id),
                    })
                }
            }
            1 => {
                let (state_prev, qa_state): (JobState, QaState) = txn.query_row(
                    "SELECT state_prev, qa_state FROM job WHERE id = ?1",
                    params![job_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;

                log_repo::append_log(txn, job_id, state_prev, new_state, message)?;

                if new_state.info().pre_run && qa_state != QaState::Unknown {
                    txn.execute(
                        "UPDATE job SET qa_state = ?1 WHERE id = ?2",
                        params![QaState::Unknown, job_id],
                    )?;
                    log_repo::append_qa(
                        txn,
                        job_id,
                        QaState::Unknown,
                        "QA state reset: job returned to a pre-run state",
                        "",
                    )?;
                }

                Ok(TransitionOutcome::Applied { state_prev })
            }
            _ => Err(StoreError::ExcessRows {
                table: "job",
                query: format!("id = {}", job_id),
            }),
        }
    })
}

/// Filter and ordering parameters for job selection.
///
/// `states = None` excludes Deleted jobs; pass an explicit list (which may
/// include Deleted) to override. `prioritize` orders by priority
/// descending; `sort` adds ascending id as a FIFO tie-break.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub states: Option<Vec<JobState>>,
    pub location: Option<String>,
    pub tasks: Option<Vec<String>>,
    pub qa_states: Option<Vec<QaState>>,
    /// Fuzzy (case-insensitive substring) match on the tag.
    pub tag: Option<String>,
    pub tiles: Option<Vec<i64>>,
    /// Observation metadata constraints: keyword paired with a constraint
    /// on its value.
    pub obs: Vec<(String, Constraint)>,
    pub prioritize: bool,
    pub sort: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl JobQuery {
    pub fn at_location(location: &str) -> Self {
        Self {
            location: Some(location.to_string()),
            ..Self::default()
        }
    }

    pub fn in_state(state: JobState) -> Self {
        Self {
            states: Some(vec![state]),
            ..Self::default()
        }
    }
}

fn build_constraints(query: &JobQuery) -> Result<ConstraintQuery, StoreError> {
    let mut cq = ConstraintQuery::new("job")?;

    match &query.states {
        Some(states) => {
            cq.push(Predicate::new(
                "state",
                Constraint::In(states.iter().copied().map(Value::from).collect()),
            ));
        }
        None => {
            cq.push(Predicate::negated(
                "state",
                Constraint::Eq(JobState::Deleted.into()),
            ));
        }
    }

    if let Some(location) = &query.location {
        cq.push(Predicate::new(
            "location",
            Constraint::Eq(location.as_str().into()),
        ));
    }
    if let Some(tasks) = &query.tasks {
        cq.push(Predicate::new(
            "task",
            Constraint::In(tasks.iter().map(|t| t.as_str().into()).collect()),
        ));
    }
    if let Some(qa_states) = &query.qa_states {
        cq.push(Predicate::new(
            "qa_state",
            Constraint::In(qa_states.iter().copied().map(Value::from).collect()),
        ));
    }
    if let Some(tag) = &query.tag {
        cq.push(Predicate::new(
            "tag",
            Constraint::Fuzzy {
                value: tag.clone(),
                wildcards: true,
            },
        ));
    }
    if let Some(tiles) = &query.tiles {
        cq.push(Predicate::new(
            "id",
            Constraint::InSelect {
                table: "tile".to_string(),
                column: "job_id".to_string(),
                preds: vec![Predicate::new(
                    "tile",
                    Constraint::In(tiles.iter().copied().map(Value::from).collect()),
                )],
            },
        ));
    }
    for (keyword, constraint) in &query.obs {
        cq.push(Predicate::new(
            "id",
            Constraint::InSelect {
                table: "obs".to_string(),
                column: "job_id".to_string(),
                preds: vec![
                    Predicate::new("keyword", Constraint::Eq(keyword.as_str().into())),
                    Predicate {
                        column: "value".to_string(),
                        constraint: constraint.clone(),
                        negate: false,
                    },
                ],
            },
        ));
    }

    Ok(cq)
}

fn order_clause(query: &JobQuery) -> String {
    let mut terms = Vec::new();
    if query.prioritize {
        terms.push("priority DESC");
    }
    if query.sort {
        terms.push("id ASC");
    }
    if terms.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", terms.join(", "))
    }
}

/// Returns the jobs matching the query, in the requested order.
///
/// This is a plain read with no claim or lock: callers wanting to act on a
/// job must follow up with a guarded [`change_state`] and treat a
/// `Conflict` as having lost the race.
pub fn find_jobs(db: &Database, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
    let clause = build_constraints(query)?.lower()?;

    let mut sql = format!("SELECT {} FROM job", JOB_COLUMNS);
    if !clause.sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clause.sql);
    }
    sql.push_str(&order_clause(query));

    let mut bind = clause.params;
    if query.limit.is_some() || query.offset.is_some() {
        sql.push_str(" LIMIT ? OFFSET ?");
        bind.push(Value::Int(query.limit.map(|l| l as i64).unwrap_or(-1)));
        bind.push(Value::Int(query.offset.unwrap_or(0) as i64));
    }

    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> =
            bind.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let jobs: Vec<JobRecord> = stmt
            .query_map(refs.as_slice(), JobRecord::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(jobs)
    })
}

/// Counts the jobs matching the query (limit/offset ignored).
pub fn count_jobs(db: &Database, query: &JobQuery) -> Result<u64, StoreError> {
    let clause = build_constraints(query)?.lower()?;

    let mut sql = "SELECT COUNT(*) FROM job".to_string();
    if !clause.sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clause.sql);
    }

    db.with_conn(|conn| {
        let refs = clause.param_refs();
        let count: u64 = conn.query_row(&sql, refs.as_slice(), |r| r.get(0))?;
        Ok(count)
    })
}

/// Returns the ids immediately before and after the given job under the
/// query's filters and ordering, for pagination. Single ordered scan.
pub fn job_prev_next(
    db: &Database,
    job_id: i64,
    query: &JobQuery,
) -> Result<(Option<i64>, Option<i64>), StoreError> {
    let clause = build_constraints(query)?.lower()?;

    let mut sql = "SELECT id FROM job".to_string();
    if !clause.sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clause.sql);
    }
    sql.push_str(&order_clause(query));

    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let refs = clause.param_refs();
        let mut rows = stmt.query(refs.as_slice())?;

        let mut prev = None;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            if id == job_id {
                let next = match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                };
                return Ok((prev, next));
            }
            prev = Some(id);
        }

        Err(StoreError::NoRows {
            table: "job",
            query: format!("id = {} within filtered listing", job_id),
        })
    })
}

fn update_scalar(
    db: &Database,
    job_id: i64,
    sql: &'static str,
    value: &dyn rusqlite::ToSql,
) -> Result<(), StoreError> {
    db.with_txn(|txn| {
        let n = txn.execute(sql, params![value, job_id])?;
        match n {
            0 => Err(StoreError::NoRows {
                table: "job",
                query: format!("id = {}", job_id),
            }),
            1 => Ok(()),
            _ => Err(StoreError::ExcessRows {
                table: "job",
                query: format!("id = {}", job_id),
            }),
        }
    })
}

/// Sets the job's processing location, optionally updating the foreign id
/// in the same statement.
pub fn set_location(
    db: &Database,
    job_id: i64,
    location: &str,
    foreign_id: Option<&str>,
) -> Result<(), StoreError> {
    match foreign_id {
        Some(foreign_id) => db.with_txn(|txn| {
            let n = txn.execute(
                "UPDATE job SET location = ?1, foreign_id = ?2 WHERE id = ?3",
                params![location, foreign_id, job_id],
            )?;
            if n == 0 {
                return Err(StoreError::NoRows {
                    table: "job",
                    query: format!("id = {}", job_id),
                });
            }
            Ok(())
        }),
        None => update_scalar(
            db,
            job_id,
            "UPDATE job SET location = ?1 WHERE id = ?2",
            &location,
        ),
    }
}

pub fn set_foreign_id(db: &Database, job_id: i64, foreign_id: &str) -> Result<(), StoreError> {
    update_scalar(
        db,
        job_id,
        "UPDATE job SET foreign_id = ?1 WHERE id = ?2",
        &foreign_id,
    )
}

pub fn set_priority(db: &Database, job_id: i64, priority: i32) -> Result<(), StoreError> {
    update_scalar(
        db,
        job_id,
        "UPDATE job SET priority = ?1 WHERE id = ?2",
        &priority,
    )
}

pub fn set_mode(db: &Database, job_id: i64, mode: &str) -> Result<(), StoreError> {
    check_mode(mode)?;
    update_scalar(db, job_id, "UPDATE job SET mode = ?1 WHERE id = ?2", &mode)
}

pub fn set_parameters(db: &Database, job_id: i64, parameters: &str) -> Result<(), StoreError> {
    update_scalar(
        db,
        job_id,
        "UPDATE job SET parameters = ?1 WHERE id = ?2",
        &parameters,
    )
}

/// A partial update: only the populated fields are written.
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub input_files: Option<Vec<String>>,
    pub parents: Option<Vec<ParentEdge>>,
    pub mode: Option<String>,
    pub parameters: Option<String>,
    pub priority: Option<i32>,
    pub tilelist: Option<Vec<i64>>,
    pub obs: Option<Vec<ObsInfo>>,
}

impl JobChanges {
    pub fn is_empty(&self) -> bool {
        self.input_files.is_none()
            && self.parents.is_none()
            && self.mode.is_none()
            && self.parameters.is_none()
            && self.priority.is_none()
            && self.tilelist.is_none()
            && self.obs.is_none()
    }

    /// True when a field that feeds the computation changed. Tile, obs and
    /// priority changes are descriptive and do not invalidate results.
    pub fn is_load_bearing(&self) -> bool {
        self.input_files.is_some()
            || self.parents.is_some()
            || self.mode.is_some()
            || self.parameters.is_some()
    }
}

/// Applies exactly the supplied fields in one unit of work.
pub fn apply_job_update(
    db: &Database,
    job_id: i64,
    changes: &JobChanges,
) -> Result<(), StoreError> {
    if let Some(mode) = &changes.mode {
        check_mode(mode)?;
    }

    db.with_txn(|txn| {
        let existing: u32 = txn.query_row(
            "SELECT COUNT(*) FROM job WHERE id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        if existing == 0 {
            return Err(StoreError::NoRows {
                table: "job",
                query: format!("id = {}", job_id),
            });
        }

        if let Some(files) = &changes.input_files {
            file_repo::replace_input_files(txn, job_id, files)?;
        }
        if let Some(parents) = &changes.parents {
            graph_repo::replace_parents_inner(txn, job_id, parents)?;
        }
        if let Some(mode) = &changes.mode {
            txn.execute(
                "UPDATE job SET mode = ?1 WHERE id = ?2",
                params![mode, job_id],
            )?;
        }
        if let Some(parameters) = &changes.parameters {
            txn.execute(
                "UPDATE job SET parameters = ?1 WHERE id = ?2",
                params![parameters, job_id],
            )?;
        }
        if let Some(priority) = &changes.priority {
            txn.execute(
                "UPDATE job SET priority = ?1 WHERE id = ?2",
                params![priority, job_id],
            )?;
        }
        if let Some(tiles) = &changes.tilelist {
            graph_repo::replace_tiles(txn, job_id, tiles)?;
        }
        if let Some(obs) = &changes.obs {
            graph_repo::replace_obs_info(txn, job_id, obs)?;
        }

        Ok(())
    })
}
