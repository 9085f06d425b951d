//! Post-migration validation: comparing source and target, auditing
//! integrity rules, and producing a scored report.
//!
//! Validation findings are data, not control flow: a run aggregates every
//! discrepancy it can find into [`ValidationError`]s and still returns
//! `Ok`. The run itself only fails on resource problems: an unknown batch
//! id or a missing destination table. Reports are re-runnable: one report
//! per validation run per batch.

use std::{collections::HashMap, fs::File, path::Path, str::FromStr, time::Instant};

use chrono::{DateTime, Utc};
use evalexpr::{ContextWithMutableVariables, HashMapContext};
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    analyzer::FileSchema,
    consolidate::{TableDefinition, UnifiedSchema},
    data,
    discovery::SourceFileStatus,
    domain::ValueDomain,
    error::{PipelineError, Result},
    migrate::{self, ConflictPolicy, MigrationBatch, MigrationEngine},
    store::{self, DestinationStore, StoredRow},
    workbook,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{token}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationLevel {
    /// Schema compatibility only.
    SchemaOnly,
    /// Every check, comparing a sampled share of migrated rows.
    #[default]
    Sampled,
    /// Every check over every row.
    Full,
}

/// A named predicate evaluated against persisted rows. Column values are
/// bound as variables under their normalized names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id: String,
    pub expression: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared table → foreign-key relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyRule {
    pub table: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    pub level: ValidationLevel,
    /// Share of migrated rows compared back to their source, in percent.
    pub sample_percentage: f64,
    pub custom_rules: Vec<BusinessRule>,
    pub foreign_keys: Vec<ForeignKeyRule>,
    /// Abort remaining checks on the first error-severity finding.
    pub stop_on_first_error: bool,
    pub error_weight: f64,
    pub warning_weight: f64,
    /// Delimiter/encoding overrides for re-reading delimited extracts.
    pub delimiter: Option<u8>,
    pub input_encoding: Option<String>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        ValidationOptions {
            level: ValidationLevel::default(),
            sample_percentage: 10.0,
            custom_rules: Vec::new(),
            foreign_keys: Vec::new(),
            stop_on_first_error: false,
            error_weight: 1.0,
            warning_weight: 0.25,
            delimiter: None,
            input_encoding: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub rule: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Identifiers of the offending records (file:row, key tuples, row ids).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Passed,
    PassedWithWarnings,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub batch_id: Uuid,
    pub status: ReportStatus,
    /// 1 − weighted finding rate over validated records, clamped to [0, 1].
    pub data_integrity_score: f64,
    pub total_records_validated: u64,
    pub checks_run: Vec<String>,
    pub errors: Vec<ValidationError>,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

const MAX_RECORD_REFS: usize = 20;

struct ValidationRun<'a, S: DestinationStore> {
    engine: &'a MigrationEngine<S>,
    batch: &'a MigrationBatch,
    schema: &'a UnifiedSchema,
    options: &'a ValidationOptions,
    errors: Vec<ValidationError>,
    total_records: u64,
    checks_run: Vec<String>,
}

/// Validates a completed (or failed) batch against its source files.
pub fn validate<S: DestinationStore>(
    engine: &MigrationEngine<S>,
    batch: &MigrationBatch,
    file_schemas: &[FileSchema],
    schema: &UnifiedSchema,
    options: &ValidationOptions,
) -> Result<ValidationReport> {
    let started = Instant::now();
    if !engine.knows_batch(batch.id) {
        return Err(PipelineError::UnknownBatch {
            batch_id: batch.id.to_string(),
        });
    }
    let table = schema.fact_table()?;
    {
        let store = engine.store().lock().expect("store lock");
        if !store.table_exists(&table.name)? {
            return Err(PipelineError::UnknownTable {
                name: table.name.clone(),
            });
        }
    }

    let mut run = ValidationRun {
        engine,
        batch,
        schema,
        options,
        errors: Vec::new(),
        total_records: 0,
        checks_run: Vec::new(),
    };

    run.check_schema_compatibility(file_schemas, table);
    if run.keep_going() && options.level != ValidationLevel::SchemaOnly {
        run.check_data_integrity(table)?;
    }
    if run.keep_going() && options.level != ValidationLevel::SchemaOnly {
        run.check_referential_integrity()?;
    }
    if run.keep_going() && options.level != ValidationLevel::SchemaOnly {
        run.check_duplicates(table)?;
    }
    if run.keep_going()
        && options.level != ValidationLevel::SchemaOnly
        && !options.custom_rules.is_empty()
    {
        run.check_business_rules(table)?;
    }

    let error_count = run
        .errors
        .iter()
        .filter(|finding| finding.severity == Severity::Error)
        .count() as f64;
    let warning_count = run
        .errors
        .iter()
        .filter(|finding| finding.severity == Severity::Warning)
        .count() as f64;
    let score = if run.total_records > 0 {
        let weighted =
            error_count * options.error_weight + warning_count * options.warning_weight;
        (1.0 - weighted / run.total_records as f64).clamp(0.0, 1.0)
    } else if error_count == 0.0 && warning_count == 0.0 {
        1.0
    } else {
        0.0
    };
    let status = if error_count > 0.0 {
        ReportStatus::Failed
    } else if warning_count > 0.0 {
        ReportStatus::PassedWithWarnings
    } else {
        ReportStatus::Passed
    };

    let report = ValidationReport {
        batch_id: batch.id,
        status,
        data_integrity_score: score,
        total_records_validated: run.total_records,
        checks_run: run.checks_run,
        errors: run.errors,
        generated_at: Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        "Validated batch {}: {:?}, score {:.3}, {} finding(s) over {} record(s)",
        batch.id,
        report.status,
        report.data_integrity_score,
        report.errors.len(),
        report.total_records_validated
    );
    Ok(report)
}

impl<S: DestinationStore> ValidationRun<'_, S> {
    fn keep_going(&self) -> bool {
        !(self.options.stop_on_first_error
            && self
                .errors
                .iter()
                .any(|finding| finding.severity == Severity::Error))
    }

    fn sample_stride(&self) -> u64 {
        match self.options.level {
            ValidationLevel::Full => 1,
            _ => {
                let share = self.options.sample_percentage.clamp(0.01, 100.0);
                (100.0 / share).round().max(1.0) as u64
            }
        }
    }

    fn check_schema_compatibility(&mut self, file_schemas: &[FileSchema], table: &TableDefinition) {
        self.checks_run.push("schema-compatibility".to_string());
        for file_schema in file_schemas {
            for column in file_schema.columns() {
                let Some(target) = table.column(&column.name) else {
                    self.errors.push(ValidationError {
                        rule: "missing-column".to_string(),
                        severity: Severity::Error,
                        table: Some(table.name.clone()),
                        column: Some(column.name.clone()),
                        records: vec![file_schema.file.clone()],
                        expected: Some("column present in unified schema".to_string()),
                        actual: Some("absent".to_string()),
                        suggestion: Some(
                            "Rebuild the unified schema including this file".to_string(),
                        ),
                    });
                    continue;
                };
                if column.domain.resolve(target.domain) != target.domain {
                    self.errors.push(ValidationError {
                        rule: "type-mismatch".to_string(),
                        severity: Severity::Error,
                        table: Some(table.name.clone()),
                        column: Some(column.name.clone()),
                        records: vec![file_schema.file.clone()],
                        expected: Some(target.domain.to_string()),
                        actual: Some(column.domain.to_string()),
                        suggestion: Some(
                            "Re-consolidate so the target domain covers this source".to_string(),
                        ),
                    });
                } else if column.domain != target.domain {
                    self.errors.push(ValidationError {
                        rule: "type-cast".to_string(),
                        severity: Severity::Info,
                        table: Some(table.name.clone()),
                        column: Some(column.name.clone()),
                        records: vec![file_schema.file.clone()],
                        expected: Some(target.domain.to_string()),
                        actual: Some(column.domain.to_string()),
                        suggestion: None,
                    });
                }
                if !target.nullable && column.nullable {
                    self.errors.push(ValidationError {
                        rule: "nullability-constraint".to_string(),
                        severity: Severity::Warning,
                        table: Some(table.name.clone()),
                        column: Some(column.name.clone()),
                        records: vec![file_schema.file.clone()],
                        expected: Some("no nulls".to_string()),
                        actual: Some("nullable source column".to_string()),
                        suggestion: None,
                    });
                }
            }
        }
    }

    /// Recomputes expected transformed values from the original extracts
    /// and compares them to what the store persisted.
    fn check_data_integrity(&mut self, table: &TableDefinition) -> Result<()> {
        self.checks_run.push("data-integrity".to_string());
        let stride = self.sample_stride();

        for record in &self.batch.records {
            if record.status != SourceFileStatus::Completed {
                continue;
            }
            let Some(file) = self
                .batch
                .files
                .iter()
                .find(|file| file.content_hash == record.content_hash)
            else {
                continue;
            };

            let stored: Vec<StoredRow> = {
                let store = self.engine.store().lock().expect("store lock");
                store.scan_rows(table, Some(&record.content_hash))?
            };
            let by_source_row: HashMap<u64, &StoredRow> =
                stored.iter().map(|row| (row.source_row, row)).collect();

            if stored.len() as u64 != record.processed {
                self.errors.push(ValidationError {
                    rule: "row-count".to_string(),
                    severity: Severity::Warning,
                    table: Some(table.name.clone()),
                    column: None,
                    records: vec![record.file.clone()],
                    expected: Some(record.processed.to_string()),
                    actual: Some(stored.len().to_string()),
                    suggestion: Some(
                        "Another file or batch may have superseded these rows".to_string(),
                    ),
                });
            }

            let contents = workbook::read_workbook(
                &file.path,
                self.options.delimiter,
                self.options.input_encoding.as_deref(),
            )?;
            let mut source_row = 0u64;
            for sheet in &contents.sheets {
                if crate::analyzer::is_metadata_sheet(&sheet.name) {
                    continue;
                }
                let Ok(plan) = migrate::build_sheet_plan(sheet, file, self.schema, table) else {
                    continue;
                };
                for row in &sheet.rows {
                    source_row += 1;
                    if (source_row - 1) % stride != 0 {
                        continue;
                    }
                    let Some(persisted) = by_source_row.get(&source_row) else {
                        // Skipped duplicate or invalid record; nothing to
                        // compare.
                        continue;
                    };
                    self.total_records += 1;
                    for (cell_idx, target) in plan.iter().enumerate() {
                        let Some((column_idx, domain, target_name)) = target else {
                            continue;
                        };
                        let cell = row.get(cell_idx).unwrap_or(&workbook::CellValue::Empty);
                        let Ok(expected) = data::convert_cell(cell, *domain) else {
                            continue;
                        };
                        let expected = expected.map(|value| value.canonical());
                        let actual = persisted.values[*column_idx].clone();
                        if expected != actual {
                            self.errors.push(ValidationError {
                                rule: "value-mismatch".to_string(),
                                severity: Severity::Error,
                                table: Some(table.name.clone()),
                                column: Some(target_name.clone()),
                                records: vec![format!("{}:{source_row}", record.file)],
                                expected,
                                actual,
                                suggestion: Some(
                                    "Re-migrate this file and re-validate".to_string(),
                                ),
                            });
                            if !self.keep_going() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            debug!(
                "Data integrity sampled {:?} at stride {stride}",
                file.path
            );
        }
        Ok(())
    }

    fn check_referential_integrity(&mut self) -> Result<()> {
        if self.options.foreign_keys.is_empty() {
            return Ok(());
        }
        self.checks_run.push("referential-integrity".to_string());
        for rule in &self.options.foreign_keys {
            if rule.columns.len() != rule.ref_columns.len() || rule.columns.is_empty() {
                self.errors.push(ValidationError {
                    rule: "foreign-key-definition".to_string(),
                    severity: Severity::Error,
                    table: Some(rule.table.clone()),
                    column: None,
                    records: Vec::new(),
                    expected: Some("matching child/parent column lists".to_string()),
                    actual: Some(format!(
                        "{} child vs {} parent column(s)",
                        rule.columns.len(),
                        rule.ref_columns.len()
                    )),
                    suggestion: None,
                });
                continue;
            }
            let join = rule
                .columns
                .iter()
                .zip(rule.ref_columns.iter())
                .map(|(child, parent)| {
                    format!(
                        "child.{} = parent.{}",
                        store::quote_ident(child),
                        store::quote_ident(parent)
                    )
                })
                .join(" AND ");
            let not_null = rule
                .columns
                .iter()
                .map(|child| format!("child.{} IS NOT NULL", store::quote_ident(child)))
                .join(" AND ");
            let select = rule
                .columns
                .iter()
                .map(|child| format!("child.{}", store::quote_ident(child)))
                .join(", ");
            let sql = format!(
                "SELECT {select} FROM {} AS child LEFT JOIN {} AS parent ON {join} WHERE {not_null} AND parent.{} IS NULL",
                store::quote_ident(&rule.table),
                store::quote_ident(&rule.ref_table),
                store::quote_ident(&rule.ref_columns[0]),
            );
            let result = {
                let store = self.engine.store().lock().expect("store lock");
                store.query_read_only(&sql)?
            };
            self.total_records += result.rows.len() as u64;
            if !result.rows.is_empty() {
                let records = result
                    .rows
                    .iter()
                    .take(MAX_RECORD_REFS)
                    .map(|row| {
                        row.iter()
                            .map(|part| part.as_deref().unwrap_or("null"))
                            .join(", ")
                    })
                    .collect();
                self.errors.push(ValidationError {
                    rule: "referential-integrity".to_string(),
                    severity: Severity::Error,
                    table: Some(rule.table.clone()),
                    column: Some(rule.columns.join("+")),
                    records,
                    expected: Some(format!(
                        "every key present in {}.{}",
                        rule.ref_table,
                        rule.ref_columns.join("+")
                    )),
                    actual: Some(format!("{} dangling reference(s)", result.rows.len())),
                    suggestion: Some("Load the referenced lookup data first".to_string()),
                });
                if !self.keep_going() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Confirms no duplicates exist beyond what the batch's conflict policy
    /// explicitly permits.
    fn check_duplicates(&mut self, table: &TableDefinition) -> Result<()> {
        if table.primary_key.is_empty() {
            return Ok(());
        }
        self.checks_run.push("duplicate-audit".to_string());
        let policy = self.batch.options.conflict_policy;
        let duplicates = {
            let store = self.engine.store().lock().expect("store lock");
            if policy == ConflictPolicy::CreateVersion {
                // Key multiplicity is expected; (key, version) must stay
                // unique.
                store.duplicate_key_versions(table)?
            } else {
                store.duplicate_keys(table)?
            }
        };
        for (key, count) in duplicates {
            self.errors.push(ValidationError {
                rule: "duplicate-audit".to_string(),
                severity: Severity::Error,
                table: Some(table.name.clone()),
                column: Some(table.primary_key.join("+")),
                records: vec![key.replace('\u{1f}', " | ").replace('\u{0}', "null")],
                expected: Some(format!("1 row per key under policy {policy}")),
                actual: Some(format!("{count} rows")),
                suggestion: Some("Roll the batch back and re-run migration".to_string()),
            });
            if !self.keep_going() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn check_business_rules(&mut self, table: &TableDefinition) -> Result<()> {
        self.checks_run.push("business-rules".to_string());
        let stride = self.sample_stride();
        let rows = {
            let store = self.engine.store().lock().expect("store lock");
            store.scan_rows(table, None)?
        };
        let sampled: Vec<&StoredRow> = rows
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx as u64 % stride == 0)
            .map(|(_, row)| row)
            .collect();
        self.total_records += sampled.len() as u64;

        for rule in &self.options.custom_rules {
            let mut violations: Vec<String> = Vec::new();
            let mut violation_count = 0u64;
            for row in &sampled {
                let mut context = HashMapContext::new();
                let mut bind_failed = false;
                for (column, value) in table.columns.iter().zip(row.values.iter()) {
                    let bound = match value {
                        None => evalexpr::Value::Empty,
                        Some(rendered) => rendered_to_evalexpr(column.domain, rendered),
                    };
                    if context.set_value(column.name.clone(), bound).is_err() {
                        bind_failed = true;
                        break;
                    }
                }
                if bind_failed {
                    continue;
                }
                match evalexpr::eval_boolean_with_context(&rule.expression, &context) {
                    Ok(true) => {}
                    Ok(false) => {
                        violation_count += 1;
                        if violations.len() < MAX_RECORD_REFS {
                            violations.push(format!("row_id {}", row.row_id));
                        }
                    }
                    Err(err) => {
                        // A rule that cannot evaluate is itself a finding,
                        // reported once.
                        self.errors.push(ValidationError {
                            rule: rule.id.clone(),
                            severity: Severity::Error,
                            table: Some(table.name.clone()),
                            column: None,
                            records: Vec::new(),
                            expected: Some("evaluable rule expression".to_string()),
                            actual: Some(err.to_string()),
                            suggestion: Some(format!(
                                "Fix the expression '{}'",
                                rule.expression
                            )),
                        });
                        violation_count = 0;
                        violations.clear();
                        break;
                    }
                }
            }
            if violation_count > 0 {
                self.errors.push(ValidationError {
                    rule: rule.id.clone(),
                    severity: rule.severity,
                    table: Some(table.name.clone()),
                    column: None,
                    records: violations,
                    expected: Some(rule.expression.clone()),
                    actual: Some(format!("{violation_count} violating row(s)")),
                    suggestion: rule.description.clone(),
                });
            }
            if !self.keep_going() {
                return Ok(());
            }
        }
        Ok(())
    }
}

fn rendered_to_evalexpr(domain: ValueDomain, rendered: &str) -> evalexpr::Value {
    match domain {
        ValueDomain::Integer => rendered
            .parse::<i64>()
            .map(evalexpr::Value::Int)
            .unwrap_or_else(|_| evalexpr::Value::String(rendered.to_string())),
        ValueDomain::Decimal => rendered
            .parse::<f64>()
            .map(evalexpr::Value::Float)
            .unwrap_or_else(|_| evalexpr::Value::String(rendered.to_string())),
        ValueDomain::Boolean => match rendered {
            "true" => evalexpr::Value::Boolean(true),
            "false" => evalexpr::Value::Boolean(false),
            other => evalexpr::Value::String(other.to_string()),
        },
        _ => evalexpr::Value::String(rendered.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
    Yaml,
}

impl FromStr for ReportFormat {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "yaml" | "yml" => Ok(ReportFormat::Yaml),
            other => Err(PipelineError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Writes the report to `path`. An unsupported format token is a usage
/// error raised before any file I/O.
pub fn export_report(report: &ValidationReport, format: &str, path: &Path) -> Result<()> {
    let format = ReportFormat::from_str(format)?;
    match format {
        ReportFormat::Json => {
            let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
            serde_json::to_writer_pretty(file, report)?;
        }
        ReportFormat::Yaml => {
            let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
            serde_yaml::to_writer(file, report)?;
        }
        ReportFormat::Csv => {
            let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record([
                "rule",
                "severity",
                "table",
                "column",
                "records",
                "expected",
                "actual",
                "suggestion",
            ])?;
            for finding in &report.errors {
                writer.write_record([
                    finding.rule.as_str(),
                    &finding.severity.to_string(),
                    finding.table.as_deref().unwrap_or(""),
                    finding.column.as_deref().unwrap_or(""),
                    &finding.records.join("; "),
                    finding.expected.as_deref().unwrap_or(""),
                    finding.actual.as_deref().unwrap_or(""),
                    finding.suggestion.as_deref().unwrap_or(""),
                ])?;
            }
            writer.flush().map_err(|err| PipelineError::io(path, err))?;
        }
    }
    info!("Exported validation report for batch {} to {:?}", report.batch_id, path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_format_parsing_rejects_unknown_tokens() {
        assert_eq!(ReportFormat::from_str("json").unwrap(), ReportFormat::Json);
        assert_eq!(ReportFormat::from_str("YAML").unwrap(), ReportFormat::Yaml);
        assert!(matches!(
            ReportFormat::from_str("parquet"),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn unsupported_export_fails_before_io() {
        let report = ValidationReport {
            batch_id: Uuid::nil(),
            status: ReportStatus::Passed,
            data_integrity_score: 1.0,
            total_records_validated: 0,
            checks_run: Vec::new(),
            errors: Vec::new(),
            generated_at: Utc::now(),
            duration_ms: 0,
        };
        let path = Path::new("/nonexistent-dir/report.parquet");
        assert!(matches!(
            export_report(&report, "parquet", path),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn rendered_values_bind_by_domain() {
        assert_eq!(
            rendered_to_evalexpr(ValueDomain::Integer, "42"),
            evalexpr::Value::Int(42)
        );
        assert_eq!(
            rendered_to_evalexpr(ValueDomain::Boolean, "true"),
            evalexpr::Value::Boolean(true)
        );
        assert_eq!(
            rendered_to_evalexpr(ValueDomain::Text, "0100000"),
            evalexpr::Value::String("0100000".to_string())
        );
    }
}
