//! Per-file schema analysis and cross-file evolution detection.
//!
//! The analyzer reads every data sheet of an extract (metadata sheets are
//! skipped by name heuristic), runs the value classifier over a bounded
//! sample per column, and produces an immutable [`FileSchema`]. A sheet
//! that fails to parse is recorded and never aborts sibling sheets; a file
//! that fails outright is recorded by [`analyze_all`] and never aborts
//! sibling files.

use std::{path::PathBuf, sync::OnceLock};

use log::{debug, info};
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::{
    classify::{self, ColumnObservation},
    data::normalize_column_name,
    discovery::SourceFileInfo,
    domain::ValueDomain,
    error::{PipelineError, Result},
    pool,
    workbook::{self, SheetData},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerOptions {
    /// Non-null values sampled per column during classification.
    pub sample_size: usize,
    /// Text columns exceeding this length promote to long-text.
    pub long_text_threshold: usize,
    pub max_workers: usize,
    /// Character encoding for delimited extracts (defaults to utf-8).
    pub input_encoding: Option<String>,
    /// Delimiter override for delimited extracts.
    pub delimiter: Option<u8>,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        AnalyzerOptions {
            sample_size: classify::DEFAULT_SAMPLE_SIZE,
            long_text_threshold: classify::DEFAULT_LONG_TEXT_THRESHOLD,
            max_workers: 4,
            input_encoding: None,
            delimiter: None,
        }
    }
}

/// One column as observed in one sheet of one file. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub raw_name: String,
    pub name: String,
    pub domain: ValueDomain,
    pub nullable: bool,
    pub max_length: usize,
    pub sentinel_count: usize,
    pub samples: Vec<String>,
    pub source_hash: String,
    pub sheet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetSchema {
    pub name: String,
    pub row_count: usize,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetIssue {
    pub sheet: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSchema {
    pub file: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub sheets: Vec<SheetSchema>,
    pub errors: Vec<SheetIssue>,
}

impl FileSchema {
    /// Columns of every data sheet, in sheet order.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.sheets.iter().flat_map(|sheet| sheet.columns.iter())
    }
}

#[derive(Debug, Clone)]
pub struct FileIssue {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AnalysisOutcome {
    pub schemas: Vec<FileSchema>,
    pub errors: Vec<FileIssue>,
}

const METADATA_SHEET_PATTERNS: &[&str] = &[
    r"(?i)description",
    r"(?i)\bfields?\b",
    r"(?i)field[ _-]",
    r"(?i)filler",
    r"(?i)update[ _-]?time",
    r"(?i)\bnotes?\b",
    r"(?i)\breadme\b",
];

fn metadata_sheet_matcher() -> &'static RegexSet {
    static MATCHER: OnceLock<RegexSet> = OnceLock::new();
    MATCHER.get_or_init(|| {
        RegexSet::new(METADATA_SHEET_PATTERNS).expect("metadata sheet patterns are valid")
    })
}

/// Sheets carrying layout notes rather than survey records.
pub fn is_metadata_sheet(name: &str) -> bool {
    metadata_sheet_matcher().is_match(name.trim())
}

/// Analyzes one extract into a [`FileSchema`].
pub fn analyze(file: &SourceFileInfo, options: &AnalyzerOptions) -> Result<FileSchema> {
    let contents = workbook::read_workbook(
        &file.path,
        options.delimiter,
        options.input_encoding.as_deref(),
    )?;

    let mut schema = FileSchema {
        file: file.name.clone(),
        path: file.path.clone(),
        content_hash: file.content_hash.clone(),
        sheets: Vec::new(),
        errors: contents
            .errors
            .into_iter()
            .map(|issue| SheetIssue {
                sheet: issue.sheet,
                message: issue.message,
            })
            .collect(),
    };

    for sheet in &contents.sheets {
        if is_metadata_sheet(&sheet.name) {
            debug!("Skipping metadata sheet '{}' in {:?}", sheet.name, file.path);
            continue;
        }
        schema.sheets.push(analyze_sheet(sheet, file, options));
    }

    info!(
        "Analyzed {:?}: {} data sheet(s), {} issue(s)",
        file.path,
        schema.sheets.len(),
        schema.errors.len()
    );
    Ok(schema)
}

fn analyze_sheet(
    sheet: &SheetData,
    file: &SourceFileInfo,
    options: &AnalyzerOptions,
) -> SheetSchema {
    let mut observations: Vec<ColumnObservation> = sheet
        .headers
        .iter()
        .map(|_| ColumnObservation::new(options.sample_size, options.long_text_threshold))
        .collect();

    for row in &sheet.rows {
        for (idx, observation) in observations.iter_mut().enumerate() {
            match row.get(idx) {
                Some(cell) => observation.observe(cell),
                // Short row: the trailing column is absent, i.e. null.
                None => observation.observe(&workbook::CellValue::Empty),
            }
        }
    }

    let columns = sheet
        .headers
        .iter()
        .zip(observations.iter())
        .map(|(raw_name, observation)| ColumnSchema {
            raw_name: raw_name.clone(),
            name: normalize_column_name(raw_name),
            domain: observation.decide(),
            nullable: observation.saw_null(),
            max_length: observation.max_length,
            sentinel_count: observation.sentinel_count,
            samples: observation.samples.clone(),
            source_hash: file.content_hash.clone(),
            sheet: sheet.name.clone(),
        })
        .collect();

    SheetSchema {
        name: sheet.name.clone(),
        row_count: sheet.rows.len(),
        columns,
    }
}

/// Analyzes a file set in parallel, capturing per-file failures.
pub fn analyze_all(files: &[SourceFileInfo], options: &AnalyzerOptions) -> AnalysisOutcome {
    let results = pool::map_parallel(
        files.iter().collect::<Vec<_>>(),
        options.max_workers,
        |_, file: &SourceFileInfo| (file.path.clone(), analyze(file, options)),
    );

    let mut outcome = AnalysisOutcome::default();
    for (path, result) in results {
        match result {
            Ok(schema) => outcome.schemas.push(schema),
            Err(err) => outcome.errors.push(FileIssue {
                path,
                reason: err.to_string(),
            }),
        }
    }
    outcome
}

/// A column name whose inferred domain differs across files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolvedColumn {
    pub name: String,
    /// (file name, domain) pairs, in file order.
    pub observed: Vec<(String, ValueDomain)>,
}

/// Unions column names across file schemas and reports every name observed
/// with more than one distinct domain.
pub fn detect_evolution(schemas: &[FileSchema]) -> Vec<EvolvedColumn> {
    let mut order: Vec<String> = Vec::new();
    let mut observed: std::collections::HashMap<String, Vec<(String, ValueDomain)>> =
        std::collections::HashMap::new();

    for schema in schemas {
        for column in schema.columns() {
            let entry = observed.entry(column.name.clone()).or_insert_with(|| {
                order.push(column.name.clone());
                Vec::new()
            });
            entry.push((schema.file.clone(), column.domain));
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let pairs = observed.remove(&name)?;
            let mut domains: Vec<ValueDomain> =
                pairs.iter().map(|(_, domain)| *domain).collect();
            domains.sort_by_key(|domain| domain.permissiveness());
            domains.dedup();
            if domains.len() > 1 {
                Some(EvolvedColumn {
                    name,
                    observed: pairs,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Convenience guard for the consolidator: a file schema with no data sheets
/// and no columns contributes nothing and usually signals a broken extract.
pub fn has_analyzable_columns(schema: &FileSchema) -> bool {
    schema.columns().next().is_some()
}

pub fn ensure_analyzable(schemas: &[FileSchema]) -> Result<()> {
    if schemas.iter().any(has_analyzable_columns) {
        Ok(())
    } else {
        Err(PipelineError::NoSchemaInput)
    }
}
