//! Pipeline configuration: one YAML-loadable document of defaults for
//! every component option struct.

use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    analyzer::AnalyzerOptions,
    consolidate::ConsolidateOptions,
    discovery::DiscoveryOptions,
    error::{PipelineError, Result},
    migrate::MigrationOptions,
    validate::ValidationOptions,
};

pub const DEFAULT_SCHEMA_NAME: &str = "oews";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Logical name the unified schema is published under.
    pub schema_name: String,
    pub discovery: DiscoveryOptions,
    pub analyzer: AnalyzerOptions,
    pub consolidate: ConsolidateOptions,
    pub migration: MigrationOptions,
    pub validation: ValidationOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            discovery: DiscoveryOptions::default(),
            analyzer: AnalyzerOptions::default(),
            consolidate: ConsolidateOptions::default(),
            migration: MigrationOptions::default(),
            validation: ValidationOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        let config: PipelineConfig = serde_yaml::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }
}
