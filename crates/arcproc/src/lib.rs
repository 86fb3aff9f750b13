//! arcproc: the job orchestration store for an astronomical
//! data-reduction archive.
//!
//! The store tracks reduction jobs through their lifecycle (queue, fetch,
//! run, transfer, ingest) in SQLite. Worker processes coordinate purely
//! through guarded state transitions; there are no locks shared between
//! processes.

pub mod actions;
pub mod admin;
pub mod config;
pub mod db;
pub mod error;
pub mod poller;
pub mod reconcile;
pub mod resolver;
pub mod state;

pub use config::{load_config, Config};
pub use db::job_store::{AddJob, JobChanges, JobQuery, JobRecord, TransitionOutcome};
pub use db::{Database, StoreError};
pub use error::{ArcprocError, ConfigError, Result};
pub use poller::{PollSummary, Poller};
pub use reconcile::{
    reconcile, reconcile_all, JobDescription, ReconcileAction, ReconcileOptions,
    ReconcileOutcome, ReconcileSummary,
};
pub use resolver::{effective_inputs, NotReadyReason, Readiness};
pub use state::{JobState, QaState};
