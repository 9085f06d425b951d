//! End-to-end facade: discover → analyze → consolidate → migrate →
//! validate in one call, for callers that want the whole flow. Each stage
//! stays independently usable through its own module; the facade only
//! threads explicit handles between them: the published schema version is
//! pinned before the first row is written.

use std::path::Path;

use log::info;

use crate::{
    analyzer::{self, AnalysisOutcome},
    config::PipelineConfig,
    consolidate,
    discovery::{self, DiscoveryResult},
    error::{PipelineError, Result},
    migrate::{MigrationBatch, MigrationEngine},
    registry::SchemaRegistry,
    store::DestinationStore,
    validate::{self, ValidationReport},
};

/// Everything one pipeline run produced, terminal and inspectable.
pub struct PipelineOutcome {
    pub discovery: DiscoveryResult,
    pub analysis: AnalysisOutcome,
    pub schema: consolidate::UnifiedSchema,
    pub batch: MigrationBatch,
    pub report: ValidationReport,
}

/// Runs the full consolidation flow over `root`, publishing the unified
/// schema into `registry` and loading rows through `engine`'s store.
pub fn run<S: DestinationStore>(
    root: &Path,
    registry: &SchemaRegistry,
    engine: &MigrationEngine<S>,
    config: &PipelineConfig,
) -> Result<PipelineOutcome> {
    let discovery = discovery::discover(root, &config.discovery)?;
    if discovery.files.is_empty() {
        return Err(PipelineError::BatchSetup {
            reason: format!("No migratable files were discovered under {root:?}"),
        });
    }

    let analysis = analyzer::analyze_all(&discovery.files, &config.analyzer);
    let mut schema = consolidate::build_unified_schema(
        &analysis.schemas,
        &config.schema_name,
        &config.consolidate,
    )?;
    let version = registry.publish(&mut schema)?;
    // Migration consumes the registry copy: explicitly versioned, never
    // "latest".
    let pinned = registry.load(&config.schema_name, version)?;

    let mut batch = engine.start_batch(
        discovery.files.clone(),
        &pinned,
        config.migration.clone(),
    )?;
    engine.run_batch(&mut batch, &pinned)?;

    let report = validate::validate(engine, &batch, &analysis.schemas, &pinned, &config.validation)?;

    info!(
        "Pipeline finished: batch {} is {}, integrity score {:.3}",
        batch.id, batch.status, report.data_integrity_score
    );
    Ok(PipelineOutcome {
        discovery,
        analysis,
        schema: pinned,
        batch,
        report,
    })
}
