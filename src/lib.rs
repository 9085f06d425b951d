//! Consolidates multi-year wage-survey spreadsheet extracts into a
//! query-ready embedded warehouse.
//!
//! The flow: [`discovery`] fingerprints the corpus, [`analyzer`] infers
//! per-file schemas through the [`classify`] value classifier,
//! [`consolidate`] merges them into one versioned unified schema persisted
//! by [`registry`], [`migrate`] loads the files in transactional chunks
//! against a pinned schema version, and [`validate`] audits the result
//! against the original extracts. [`pipeline`] chains the whole flow.

pub mod analyzer;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod consolidate;
pub mod data;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod migrate;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod store;
pub mod validate;
pub mod workbook;

use std::{env, sync::OnceLock};

use log::LevelFilter;

pub use crate::{
    analyzer::{AnalyzerOptions, ColumnSchema, FileSchema, SheetSchema},
    checkpoint::CheckpointToken,
    config::PipelineConfig,
    consolidate::{ColumnMapping, ConsolidateOptions, TableDefinition, UnifiedSchema},
    discovery::{DiscoveryOptions, DiscoveryResult, SourceFileInfo, SourceFileStatus},
    domain::ValueDomain,
    error::{PipelineError, Result},
    migrate::{
        BatchStatus, ConflictPolicy, MigrationBatch, MigrationEngine, MigrationOptions,
        MigrationRecord,
    },
    registry::SchemaRegistry,
    store::{DestinationStore, SqliteStore},
    validate::{
        BusinessRule, Severity, ValidationLevel, ValidationOptions, ValidationReport,
        export_report, validate,
    },
};

static LOGGER: OnceLock<()> = OnceLock::new();

/// Opt-in logging setup for binaries and tests; embedding applications
/// that configure their own logger can skip it.
pub fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("oews_warehouse", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}
