//! Store error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::UnknownState;

/// Errors from store operations.
///
/// `NoRows` and `ExcessRows` are distinguished kinds that callers match on:
/// `NoRows` is an expected-absence condition (no files recorded yet, tag not
/// found), `ExcessRows` means a uniqueness invariant was violated and is
/// always a bug. Lost claim races are not errors at all; see
/// [`TransitionOutcome`](crate::db::job_store::TransitionOutcome).
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// No rows found where at least one was required.
    #[error("No rows found in table {table}, matching \"{query}\"")]
    NoRows { table: &'static str, query: String },

    /// More rows found than a uniqueness invariant allows.
    #[error("More than the expected number of rows in table {table}, matching \"{query}\"")]
    ExcessRows { table: &'static str, query: String },

    /// A table or column name failed the identifier allow-list.
    #[error("Invalid SQL identifier: '{0}'")]
    InvalidIdentifier(String),

    /// A state code outside the lifecycle state set.
    #[error("Invalid state: {0}")]
    InvalidState(#[from] UnknownState),

    /// A job tag that already exists in the store.
    #[error("Job with tag '{0}' already exists")]
    DuplicateTag(String),

    /// Any other argument violation (self-parenting, missing inputs, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// True for the expected-absence kind, which callers often treat as
    /// "empty" rather than a failure.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, StoreError::NoRows { .. })
    }
}
