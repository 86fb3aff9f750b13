//! Job lifecycle states and QA states.
//!
//! Each state is persisted as a single-character code in the `job` table.
//! The phase/active/pre-run grouping drives guard conditions elsewhere:
//! "active" states are owned by a worker process right now, "pre-run"
//! states have not started executing (re-entering one resets QA).

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use thiserror::Error;

/// A state code that is not a member of the lifecycle state set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown state code '{0}'")]
pub struct UnknownState(pub String);

/// Lifecycle phase, used for display grouping and guard conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Queue,
    Fetch,
    Run,
    Complete,
    Error,
}

/// Static information about a lifecycle state.
#[derive(Debug, Clone, Copy)]
pub struct StateInfo {
    pub name: &'static str,
    pub phase: Phase,
    /// A worker process currently owns jobs in this state.
    pub active: bool,
    /// The job has not yet started executing.
    pub pre_run: bool,
    /// No outgoing transitions.
    pub final_state: bool,
}

/// The closed set of job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Unknown,
    Queued,
    Missing,
    Fetching,
    Waiting,
    Running,
    Processed,
    Transferring,
    IngestQueue,
    IngestFetch,
    Ingestion,
    Ingesting,
    Complete,
    Error,
    Deleted,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 15] = [
        JobState::Unknown,
        JobState::Queued,
        JobState::Missing,
        JobState::Fetching,
        JobState::Waiting,
        JobState::Running,
        JobState::Processed,
        JobState::Transferring,
        JobState::IngestQueue,
        JobState::IngestFetch,
        JobState::Ingestion,
        JobState::Ingesting,
        JobState::Complete,
        JobState::Error,
        JobState::Deleted,
    ];

    /// The single-character code stored in the database.
    pub fn code(self) -> char {
        match self {
            JobState::Unknown => '?',
            JobState::Queued => 'Q',
            JobState::Missing => 'M',
            JobState::Fetching => 'F',
            JobState::Waiting => 'W',
            JobState::Running => 'S',
            JobState::Processed => 'P',
            JobState::Transferring => 'X',
            JobState::IngestQueue => 'G',
            JobState::IngestFetch => 'H',
            JobState::Ingestion => 'I',
            JobState::Ingesting => 'J',
            JobState::Complete => 'Y',
            JobState::Error => 'E',
            JobState::Deleted => 'D',
        }
    }

    /// Looks up a state by its stored code.
    pub fn from_code(code: &str) -> Result<JobState, UnknownState> {
        match code {
            "?" => Ok(JobState::Unknown),
            "Q" => Ok(JobState::Queued),
            "M" => Ok(JobState::Missing),
            "F" => Ok(JobState::Fetching),
            "W" => Ok(JobState::Waiting),
            "S" => Ok(JobState::Running),
            "P" => Ok(JobState::Processed),
            "X" => Ok(JobState::Transferring),
            "G" => Ok(JobState::IngestQueue),
            "H" => Ok(JobState::IngestFetch),
            "I" => Ok(JobState::Ingestion),
            "J" => Ok(JobState::Ingesting),
            "Y" => Ok(JobState::Complete),
            "E" => Ok(JobState::Error),
            "D" => Ok(JobState::Deleted),
            other => Err(UnknownState(other.to_string())),
        }
    }

    pub fn info(self) -> StateInfo {
        match self {
            JobState::Unknown => StateInfo {
                name: "Unknown",
                phase: Phase::Queue,
                active: false,
                pre_run: true,
                final_state: false,
            },
            JobState::Queued => StateInfo {
                name: "Queued",
                phase: Phase::Queue,
                active: false,
                pre_run: true,
                final_state: false,
            },
            JobState::Missing => StateInfo {
                name: "Missing",
                phase: Phase::Queue,
                active: false,
                pre_run: true,
                final_state: false,
            },
            JobState::Fetching => StateInfo {
                name: "Fetching",
                phase: Phase::Fetch,
                active: true,
                pre_run: true,
                final_state: false,
            },
            JobState::Waiting => StateInfo {
                name: "Waiting",
                phase: Phase::Fetch,
                active: false,
                pre_run: true,
                final_state: false,
            },
            JobState::Running => StateInfo {
                name: "Running",
                phase: Phase::Run,
                active: true,
                pre_run: false,
                final_state: false,
            },
            JobState::Processed => StateInfo {
                name: "Processed",
                phase: Phase::Run,
                active: false,
                pre_run: false,
                final_state: false,
            },
            JobState::Transferring => StateInfo {
                name: "Transferring",
                phase: Phase::Run,
                active: false,
                pre_run: false,
                final_state: false,
            },
            JobState::IngestQueue => StateInfo {
                name: "Queued to ingest",
                phase: Phase::Run,
                active: false,
                pre_run: false,
                final_state: false,
            },
            JobState::IngestFetch => StateInfo {
                name: "Fetching to ingest",
                phase: Phase::Run,
                active: true,
                pre_run: false,
                final_state: false,
            },
            JobState::Ingestion => StateInfo {
                name: "Waiting to ingest",
                phase: Phase::Run,
                active: false,
                pre_run: false,
                final_state: false,
            },
            JobState::Ingesting => StateInfo {
                name: "Ingesting",
                phase: Phase::Run,
                active: true,
                pre_run: false,
                final_state: false,
            },
            JobState::Complete => StateInfo {
                name: "Complete",
                phase: Phase::Complete,
                active: false,
                pre_run: false,
                final_state: true,
            },
            JobState::Error => StateInfo {
                name: "Error",
                phase: Phase::Error,
                active: false,
                pre_run: false,
                final_state: false,
            },
            JobState::Deleted => StateInfo {
                name: "Deleted",
                phase: Phase::Error,
                active: false,
                pre_run: false,
                final_state: true,
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Run-phase states past execution, plus Complete. A parent job in one
    /// of these states has usable output files.
    pub fn is_post_run(self) -> bool {
        matches!(
            self,
            JobState::Processed
                | JobState::Transferring
                | JobState::IngestQueue
                | JobState::IngestFetch
                | JobState::Ingestion
                | JobState::Ingesting
                | JobState::Complete
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code().to_string()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_str()?;
        JobState::from_code(code).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Quality-assessment status, independent of the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QaState {
    Unknown,
    Good,
    Questionable,
    Bad,
}

impl QaState {
    pub const ALL: [QaState; 4] = [
        QaState::Unknown,
        QaState::Good,
        QaState::Questionable,
        QaState::Bad,
    ];

    pub fn code(self) -> char {
        match self {
            QaState::Unknown => '?',
            QaState::Good => 'G',
            QaState::Questionable => 'Q',
            QaState::Bad => 'B',
        }
    }

    pub fn from_code(code: &str) -> Result<QaState, UnknownState> {
        match code {
            "?" => Ok(QaState::Unknown),
            "G" => Ok(QaState::Good),
            "Q" => Ok(QaState::Questionable),
            "B" => Ok(QaState::Bad),
            other => Err(UnknownState(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QaState::Unknown => "Unknown",
            QaState::Good => "Good",
            QaState::Questionable => "Questionable",
            QaState::Bad => "Bad",
        }
    }
}

impl std::fmt::Display for QaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl ToSql for QaState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code().to_string()))
    }
}

impl FromSql for QaState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_str()?;
        QaState::from_code(code).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for state in JobState::ALL {
            let code = state.code().to_string();
            assert_eq!(JobState::from_code(&code).unwrap(), state);
        }
        for qa in QaState::ALL {
            let code = qa.code().to_string();
            assert_eq!(QaState::from_code(&code).unwrap(), qa);
        }
    }

    #[test]
    fn test_codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for state in JobState::ALL {
            assert!(seen.insert(state.code()), "duplicate code {}", state.code());
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(JobState::from_code("!").is_err());
        assert!(JobState::from_code("").is_err());
        assert!(JobState::from_code("QQ").is_err());
        assert!(QaState::from_code("!").is_err());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::Unknown.name(), "Unknown");
        assert_eq!(JobState::IngestQueue.name(), "Queued to ingest");
        assert_eq!(JobState::Complete.name(), "Complete");
    }

    #[test]
    fn test_state_info_flags() {
        assert!(!JobState::Waiting.info().active);
        assert!(JobState::Fetching.info().active);
        assert!(JobState::Running.info().active);
        assert!(JobState::Ingesting.info().active);
        assert!(!JobState::IngestQueue.info().active);

        assert_eq!(JobState::Ingestion.info().phase, Phase::Run);
        assert_eq!(JobState::Unknown.info().phase, Phase::Queue);

        assert!(JobState::Queued.info().pre_run);
        assert!(!JobState::Processed.info().pre_run);

        assert!(JobState::Complete.info().final_state);
        assert!(JobState::Deleted.info().final_state);
        assert!(!JobState::Error.info().final_state);
        assert!(!JobState::Ingesting.info().final_state);
    }

    #[test]
    fn test_post_run() {
        assert!(JobState::Processed.is_post_run());
        assert!(JobState::Complete.is_post_run());
        assert!(JobState::IngestFetch.is_post_run());
        assert!(!JobState::Running.is_post_run());
        assert!(!JobState::Error.is_post_run());
        assert!(!JobState::Deleted.is_post_run());
    }
}
