//! Schema consolidation: merging per-file schemas into one versioned
//! [`UnifiedSchema`].
//!
//! The unified column set is the union of normalized names across every
//! contributing file, in first-seen order. A name observed with more than
//! one domain resolves through the conflict lattice
//! ([`ValueDomain::resolve`]), so every historical value stays
//! representable. Consolidation is all-or-nothing: malformed or empty input
//! fails the build and never yields a partial schema.

use std::collections::HashMap;

use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    analyzer::{self, ColumnSchema, FileSchema},
    domain::ValueDomain,
    error::{PipelineError, Result},
};

pub const DEFAULT_FACT_TABLE: &str = "survey_facts";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidateOptions {
    /// Name of the single logical fact table.
    pub table_name: String,
    /// Normalized names of the duplicate-detection key columns.
    pub primary_key: Vec<String>,
}

impl Default for ConsolidateOptions {
    fn default() -> Self {
        ConsolidateOptions {
            table_name: DEFAULT_FACT_TABLE.to_string(),
            primary_key: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnifiedColumn {
    pub name: String,
    pub domain: ValueDomain,
    pub nullable: bool,
    pub max_length: usize,
    /// Number of contributing files that carry this column.
    pub source_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<UnifiedColumn>,
    pub primary_key: Vec<String>,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&UnifiedColumn> {
        self.columns.iter().find(|column| column.name == name)
    }
}

/// A recorded lattice promotion, kept for compatibility reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainPromotion {
    pub column: String,
    pub observed: Vec<ValueDomain>,
    pub resolved: ValueDomain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnTransform {
    /// Suppression markers become null in the (non-textual) target column.
    SentinelToNull,
    /// Source domain differs from the resolved target domain.
    Cast {
        from: ValueDomain,
        to: ValueDomain,
    },
    /// Raw header differs from the normalized target name.
    Rename,
}

/// Links one file's column to its unified target column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_hash: String,
    pub sheet: String,
    pub source_column: String,
    pub source_domain: ValueDomain,
    pub target_table: String,
    pub target_column: String,
    pub transforms: Vec<ColumnTransform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedSchema {
    pub name: String,
    /// Monotonically increasing; assigned by the registry on publish.
    pub version: u32,
    pub tables: Vec<TableDefinition>,
    pub source_file_count: usize,
    pub promotions: Vec<DomainPromotion>,
    pub mappings: Vec<ColumnMapping>,
}

impl UnifiedSchema {
    pub fn fact_table(&self) -> Result<&TableDefinition> {
        self.tables
            .first()
            .ok_or_else(|| PipelineError::EmptySchema {
                name: self.name.clone(),
            })
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn column_count(&self) -> usize {
        self.tables.iter().map(|table| table.columns.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.column_count() == 0
    }

    /// Mappings contributed by one source file, keyed by content hash.
    pub fn mappings_for(&self, source_hash: &str) -> Vec<&ColumnMapping> {
        self.mappings
            .iter()
            .filter(|mapping| mapping.source_hash == source_hash)
            .collect()
    }

    /// Stable fingerprint of the structural parts (tables, columns, keys).
    /// Two schemas with equal signatures are interchangeable for migration.
    pub fn structural_signature(&self) -> String {
        self.tables
            .iter()
            .map(|table| {
                let columns = table
                    .columns
                    .iter()
                    .map(|column| {
                        format!(
                            "{}:{}:{}",
                            column.name,
                            column.domain.as_str(),
                            if column.nullable { "null" } else { "req" }
                        )
                    })
                    .join(",");
                format!("{}[{}]pk({})", table.name, columns, table.primary_key.join("+"))
            })
            .join(";")
    }
}

struct ColumnAccumulator {
    name: String,
    domains: Vec<ValueDomain>,
    nullable: bool,
    max_length: usize,
    /// Content hashes of the files carrying this column; a multi-sheet file
    /// counts once.
    files: std::collections::HashSet<String>,
}

/// Merges the analyzed file schemas into one unified schema (version 1;
/// the registry assigns the real version on publish).
pub fn build_unified_schema(
    schemas: &[FileSchema],
    name: &str,
    options: &ConsolidateOptions,
) -> Result<UnifiedSchema> {
    if schemas.is_empty() {
        return Err(PipelineError::NoSchemaInput);
    }
    analyzer::ensure_analyzable(schemas)?;

    let mut order: Vec<String> = Vec::new();
    let mut accumulators: HashMap<String, ColumnAccumulator> = HashMap::new();

    for schema in schemas {
        for column in schema.columns() {
            let accumulator = accumulators
                .entry(column.name.clone())
                .or_insert_with(|| {
                    order.push(column.name.clone());
                    ColumnAccumulator {
                        name: column.name.clone(),
                        domains: Vec::new(),
                        nullable: false,
                        max_length: 0,
                        files: std::collections::HashSet::new(),
                    }
                });
            if !accumulator.domains.contains(&column.domain) {
                accumulator.domains.push(column.domain);
            }
            accumulator.nullable |= column.nullable;
            accumulator.max_length = accumulator.max_length.max(column.max_length);
            accumulator.files.insert(schema.content_hash.clone());
        }
    }

    let contributing_files = schemas.len();
    let mut columns = Vec::with_capacity(order.len());
    let mut promotions = Vec::new();
    for name in &order {
        let accumulator = &accumulators[name];
        let resolved = ValueDomain::resolve_all(accumulator.domains.iter().copied())
            .unwrap_or(ValueDomain::Text);
        if accumulator.domains.len() > 1 {
            promotions.push(DomainPromotion {
                column: accumulator.name.clone(),
                observed: accumulator.domains.clone(),
                resolved,
            });
        }
        columns.push(UnifiedColumn {
            name: accumulator.name.clone(),
            domain: resolved,
            // Absent from any contributor means null for that file's rows.
            nullable: accumulator.nullable || accumulator.files.len() < contributing_files,
            max_length: accumulator.max_length,
            source_count: accumulator.files.len(),
        });
    }

    for key in &options.primary_key {
        if !columns.iter().any(|column| &column.name == key) {
            return Err(PipelineError::UnknownColumn {
                schema: name.to_string(),
                column: key.clone(),
            });
        }
    }

    let table = TableDefinition {
        name: options.table_name.clone(),
        columns,
        primary_key: options.primary_key.clone(),
    };

    let mappings = schemas
        .iter()
        .flat_map(|schema| schema.columns())
        .map(|column| build_mapping(column, &table))
        .collect();

    let schema = UnifiedSchema {
        name: name.to_string(),
        version: 1,
        tables: vec![table],
        source_file_count: contributing_files,
        promotions,
        mappings,
    };
    info!(
        "Consolidated {} file schema(s) into '{}': {} column(s), {} promotion(s)",
        contributing_files,
        schema.name,
        schema.column_count(),
        schema.promotions.len()
    );
    Ok(schema)
}

fn build_mapping(column: &ColumnSchema, table: &TableDefinition) -> ColumnMapping {
    let target = table
        .column(&column.name)
        .expect("every analyzed column is part of the union");
    let mut transforms = Vec::new();
    if column.raw_name != column.name {
        transforms.push(ColumnTransform::Rename);
    }
    if column.domain != target.domain {
        transforms.push(ColumnTransform::Cast {
            from: column.domain,
            to: target.domain,
        });
    }
    if column.sentinel_count > 0 && !target.domain.is_textual() {
        transforms.push(ColumnTransform::SentinelToNull);
    }
    ColumnMapping {
        source_hash: column.source_hash.clone(),
        sheet: column.sheet.clone(),
        source_column: column.raw_name.clone(),
        source_domain: column.domain,
        target_table: table.name.clone(),
        target_column: column.name.clone(),
        transforms,
    }
}
