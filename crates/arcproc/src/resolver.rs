//! Dependency resolution: computing the effective input set of a job.
//!
//! A job's inputs come from two sources: filenames registered directly
//! against the job, and output files of its parent jobs filtered through
//! each edge's regular expression. Resolution is a pure read; it never
//! mutates the store. Callers (the poller) decide what a non-ready result
//! means for the job's state.

use std::collections::HashSet;
use std::path::PathBuf;

use regex::Regex;

use crate::config::Config;
use crate::db::error::StoreError;
use crate::db::{file_repo, graph_repo, Database};
use crate::state::JobState;

/// The outcome of dependency resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every input is accounted for; paths are in first-seen order with
    /// duplicates removed.
    Ready(Vec<PathBuf>),
    /// At least one input is not yet available. The first blocker found is
    /// reported; resolution stops there.
    NotReady(NotReadyReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    /// A parent job has not finished producing its outputs.
    ParentNotReady { parent: i64, state: JobState },
    /// A required file is not present on disk at this site.
    NotAtSite { filename: String },
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotReadyReason::ParentNotReady { parent, state } => {
                write!(f, "parent job {} is in state {}", parent, state)
            }
            NotReadyReason::NotAtSite { filename } => {
                write!(f, "file '{}' is not available at this site", filename)
            }
        }
    }
}

/// Resolves the effective input file set for a job.
///
/// Direct inputs are looked for under the archive root and then the job's
/// staging input directory. Parent-derived inputs require the parent to be
/// post-run; its recorded outputs are filtered through the edge's pattern
/// and looked for in the parent's output directory. An unparsable filter
/// pattern is a configuration fault and fails the call rather than holding
/// the job back as not ready.
pub fn effective_inputs(
    db: &Database,
    config: &Config,
    job_id: i64,
) -> Result<Readiness, StoreError> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();

    let inputs = match file_repo::get_input_files(db, job_id) {
        Ok(files) => files,
        Err(e) if e.is_no_rows() => Vec::new(),
        Err(e) => return Err(e),
    };

    for filename in inputs {
        let archived = config.archive_root.join(&filename);
        let staged = config.job_input_dir(job_id).join(&filename);
        let path = if archived.is_file() {
            archived
        } else if staged.is_file() {
            staged
        } else {
            return Ok(Readiness::NotReady(NotReadyReason::NotAtSite {
                filename,
            }));
        };
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }

    let parents = match graph_repo::get_parents_with_state(db, job_id) {
        Ok(parents) => parents,
        Err(e) if e.is_no_rows() => Vec::new(),
        Err(e) => return Err(e),
    };

    for (parent, filter, state) in parents {
        if !state.is_post_run() {
            return Ok(Readiness::NotReady(NotReadyReason::ParentNotReady {
                parent,
                state,
            }));
        }

        let pattern = Regex::new(&filter).map_err(|e| {
            StoreError::InvalidArgument(format!(
                "invalid output filter '{}' on parent {}: {}",
                filter, parent, e
            ))
        })?;

        let outputs = match file_repo::get_output_files(db, parent) {
            Ok(files) => files,
            Err(e) if e.is_no_rows() => Vec::new(),
            Err(e) => return Err(e),
        };

        let output_dir = config.job_output_dir(parent);
        for output in outputs {
            if !pattern.is_match(&output.filename) {
                continue;
            }
            let path = output_dir.join(&output.filename);
            if !path.is_file() {
                return Ok(Readiness::NotReady(NotReadyReason::NotAtSite {
                    filename: output.filename,
                }));
            }
            if seen.insert(path.clone()) {
                paths.push(path);
            }
        }
    }

    Ok(Readiness::Ready(paths))
}
