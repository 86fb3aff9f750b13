//! JSON configuration with schema validation, plus the on-disk layout
//! helpers for per-job directories.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::default_database_path;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../schema/config-v1.json");

const DEFAULT_MISSING_RETRY_LIMIT: u64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Path to the SQLite job store. Defaults to the canonical location
    /// under the home directory when absent.
    pub database_path: Option<PathBuf>,
    pub archive_root: PathBuf,
    pub staging_root: PathBuf,
    pub output_root: PathBuf,
    #[serde(default = "default_missing_retry_limit")]
    pub missing_retry_limit: u64,
}

fn default_missing_retry_limit() -> u64 {
    DEFAULT_MISSING_RETRY_LIMIT
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(default_database_path)
    }

    /// Staging directory for a job's fetched input files.
    pub fn job_input_dir(&self, job_id: i64) -> PathBuf {
        self.staging_root.join("input").join(grouped_decimal(job_id))
    }

    /// Directory holding a job's reduced output files.
    pub fn job_output_dir(&self, job_id: i64) -> PathBuf {
        self.output_root.join(grouped_decimal(job_id))
    }
}

/// Splits a job id into a three-level directory fragment so no single
/// directory accumulates millions of entries: 123 becomes `000/000/123`.
fn grouped_decimal(job_id: i64) -> PathBuf {
    let digits = format!("{:09}", job_id);
    let mut path = PathBuf::new();
    // Ids beyond nine digits keep their extra digits in the first group.
    let split = digits.len() - 6;
    path.push(&digits[..split]);
    path.push(&digits[split..split + 3]);
    path.push(&digits[split + 3..]);
    path
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    for (name, root) in [
        ("archive_root", &config.archive_root),
        ("staging_root", &config.staging_root),
        ("output_root", &config.output_root),
    ] {
        if root.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("{} must not be empty", name),
            });
        }
    }

    Ok(())
}
