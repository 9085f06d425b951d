//! Failure taxonomy for the consolidation pipeline.
//!
//! Per-item problems (one file, one sheet, one record) are captured into
//! result structures by the component that saw them and never abort sibling
//! work. Only resource-acquisition failures (an unreadable root, a missing
//! schema version, an unknown batch or checkpoint) surface as
//! [`PipelineError`] values to the immediate caller.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The discovery root itself is missing or unreadable.
    #[error("Discovery root {path:?} is not readable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unified schema '{name}' defines no columns")]
    EmptySchema { name: String },

    #[error("No file schemas were provided to consolidate")]
    NoSchemaInput,

    #[error("Column '{column}' is not part of unified schema '{schema}'")]
    UnknownColumn { schema: String, column: String },

    #[error("Schema '{name}' version {version} not found in registry")]
    UnknownSchemaVersion { name: String, version: u32 },

    #[error("Unknown migration batch '{batch_id}'")]
    UnknownBatch { batch_id: String },

    #[error("Table '{name}' does not exist in the destination store")]
    UnknownTable { name: String },

    #[error("Migration batch cannot start: {reason}")]
    BatchSetup { reason: String },

    #[error("Invalid file status transition from '{from}' to '{to}'")]
    InvalidStatus { from: String, to: String },

    #[error("Duplicate key ({key}) rejected by fail-on-conflict policy")]
    DuplicateKey { key: String },

    #[error("Invalid rollback checkpoint: {reason}")]
    InvalidCheckpoint { reason: String },

    #[error("Unsupported report format '{0}'. Supported formats: json, csv, yaml")]
    UnsupportedFormat(String),

    #[error("Statement rejected by the read-only query surface: {0}")]
    MutationRejected(String),

    #[error("Unknown encoding '{0}'")]
    UnknownEncoding(String),

    #[error("Unknown value domain '{0}'")]
    UnknownDomain(String),

    #[error("Destination store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
