mod common;

use common::TestWorkspace;
use oews_warehouse::{
    BatchStatus, BusinessRule, DestinationStore, MigrationEngine, MigrationOptions,
    PipelineError, Severity, SqliteStore, ValidationLevel, ValidationOptions, export_report,
    validate,
    store::MigrationRow,
    validate::{ForeignKeyRule, ReportStatus},
};

struct Loaded {
    engine: MigrationEngine<SqliteStore>,
    batch: oews_warehouse::MigrationBatch,
    schemas: Vec<oews_warehouse::FileSchema>,
    unified: oews_warehouse::UnifiedSchema,
}

fn load_scenario(workspace: &TestWorkspace) -> Loaded {
    common::write_scenario_files(workspace);
    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);
    let unified = common::build_keyed_schema(&schemas);
    let engine = MigrationEngine::new(SqliteStore::open_in_memory().expect("in-memory store"));
    let mut batch = engine
        .start_batch(
            files,
            &unified,
            MigrationOptions {
                max_workers: 1,
                ..MigrationOptions::default()
            },
        )
        .unwrap();
    engine.run_batch(&mut batch, &unified).unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    Loaded {
        engine,
        batch,
        schemas,
        unified,
    }
}

fn full_options() -> ValidationOptions {
    ValidationOptions {
        level: ValidationLevel::Full,
        ..ValidationOptions::default()
    }
}

#[test]
fn a_clean_batch_scores_one() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &full_options(),
    )
    .unwrap();

    assert!(
        !report
            .errors
            .iter()
            .any(|finding| matches!(finding.severity, Severity::Error | Severity::Warning)),
        "unexpected findings: {:?}",
        report.errors
    );
    assert_eq!(report.data_integrity_score, 1.0);
    assert_eq!(report.status, ReportStatus::Passed);
    assert!(report.total_records_validated > 0);
    assert!(report.checks_run.contains(&"data-integrity".to_string()));
    assert!(report.checks_run.contains(&"duplicate-audit".to_string()));
}

#[test]
fn score_stays_within_bounds_under_heavy_findings() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    // Corrupt the persisted copy of every year-A row by appending rows
    // that shadow them with wrong values under the same source positions.
    let year_a = loaded
        .batch
        .records
        .iter()
        .find(|record| record.file == "wages_2019")
        .unwrap();
    let table = loaded.unified.fact_table().unwrap().clone();
    {
        let mut store = loaded.engine.store().lock().unwrap();
        let tampered: Vec<MigrationRow> = (1u64..=3)
            .map(|source_row| MigrationRow {
                source_hash: year_a.content_hash.clone(),
                source_row,
                source_version: 1,
                values: vec![
                    Some(oews_warehouse::data::Value::Integer(42)),
                    Some(oews_warehouse::data::Value::Text(format!("tampered-{source_row}"))),
                    None,
                    None,
                ],
            })
            .collect();
        store.insert_chunk(&table, &tampered).unwrap();
    }

    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &full_options(),
    )
    .unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    assert!(
        report
            .errors
            .iter()
            .any(|finding| finding.rule == "value-mismatch")
    );
    assert!(report.data_integrity_score >= 0.0);
    assert!(report.data_integrity_score < 1.0);
}

#[test]
fn business_rules_report_violations_with_severity() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    let options = ValidationOptions {
        level: ValidationLevel::Full,
        custom_rules: vec![
            BusinessRule {
                id: "employment-non-negative".to_string(),
                expression: "tot_emp >= 0".to_string(),
                severity: Severity::Error,
                description: None,
            },
            BusinessRule {
                id: "small-statewide-counts".to_string(),
                expression: "tot_emp < 100".to_string(),
                severity: Severity::Warning,
                description: Some("Counts usually stay below 100".to_string()),
            },
        ],
        ..ValidationOptions::default()
    };
    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &options,
    )
    .unwrap();

    // All counts are non-negative, but several exceed 100.
    assert!(!report.errors.iter().any(|f| f.rule == "employment-non-negative"));
    let warning = report
        .errors
        .iter()
        .find(|f| f.rule == "small-statewide-counts")
        .expect("warning rule fires");
    assert_eq!(warning.severity, Severity::Warning);
    assert!(!warning.records.is_empty());
    assert_eq!(report.status, ReportStatus::PassedWithWarnings);
    assert!(report.data_integrity_score < 1.0);
}

#[test]
fn unevaluable_rules_are_error_findings_not_run_failures() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    let options = ValidationOptions {
        level: ValidationLevel::Full,
        custom_rules: vec![BusinessRule {
            id: "broken-rule".to_string(),
            expression: "no_such_column > 1".to_string(),
            severity: Severity::Info,
            description: None,
        }],
        ..ValidationOptions::default()
    };
    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &options,
    )
    .unwrap();
    let finding = report
        .errors
        .iter()
        .find(|f| f.rule == "broken-rule")
        .expect("broken rule reported");
    assert_eq!(finding.severity, Severity::Error);
}

#[test]
fn referential_integrity_reports_dangling_keys() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    // Self-referential check: new_col values never appear as area codes.
    let options = ValidationOptions {
        level: ValidationLevel::Full,
        foreign_keys: vec![ForeignKeyRule {
            table: "survey_facts".to_string(),
            columns: vec!["new_col".to_string()],
            ref_table: "survey_facts".to_string(),
            ref_columns: vec!["area".to_string()],
        }],
        ..ValidationOptions::default()
    };
    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &options,
    )
    .unwrap();
    let finding = report
        .errors
        .iter()
        .find(|f| f.rule == "referential-integrity")
        .expect("dangling reference reported");
    assert_eq!(finding.severity, Severity::Error);
    assert!(finding.actual.as_deref().unwrap().contains("dangling"));
}

#[test]
fn duplicate_audit_respects_the_conflict_policy() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    // Force a duplicate behind the policy's back.
    let table = loaded.unified.fact_table().unwrap().clone();
    {
        let mut store = loaded.engine.store().lock().unwrap();
        store
            .insert_chunk(
                &table,
                &[MigrationRow {
                    source_hash: "rogue".to_string(),
                    source_row: 1,
                    source_version: 1,
                    values: vec![
                        Some(oews_warehouse::data::Value::Integer(100000)),
                        Some(oews_warehouse::data::Value::Text("11-1011".to_string())),
                        None,
                        None,
                    ],
                }],
            )
            .unwrap();
    }

    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &full_options(),
    )
    .unwrap();
    let finding = report
        .errors
        .iter()
        .find(|f| f.rule == "duplicate-audit")
        .expect("duplicate reported");
    assert!(finding.records[0].contains("11-1011"));
    assert_eq!(report.status, ReportStatus::Failed);
}

#[test]
fn stop_on_first_error_short_circuits_later_checks() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    // Same tampering as the score test, with short-circuiting on.
    let year_a = loaded
        .batch
        .records
        .iter()
        .find(|record| record.file == "wages_2019")
        .unwrap();
    let table = loaded.unified.fact_table().unwrap().clone();
    {
        let mut store = loaded.engine.store().lock().unwrap();
        store
            .insert_chunk(
                &table,
                &[MigrationRow {
                    source_hash: year_a.content_hash.clone(),
                    source_row: 1,
                    source_version: 1,
                    values: vec![
                        Some(oews_warehouse::data::Value::Integer(42)),
                        Some(oews_warehouse::data::Value::Text("tampered".to_string())),
                        None,
                        None,
                    ],
                }],
            )
            .unwrap();
    }

    let options = ValidationOptions {
        level: ValidationLevel::Full,
        stop_on_first_error: true,
        ..ValidationOptions::default()
    };
    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &options,
    )
    .unwrap();
    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.checks_run.contains(&"data-integrity".to_string()));
    assert!(!report.checks_run.contains(&"duplicate-audit".to_string()));
}

#[test]
fn validating_an_unknown_batch_fails_the_run() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    let stranger = MigrationEngine::new(SqliteStore::open_in_memory().unwrap());
    let result = validate(
        &stranger,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &ValidationOptions::default(),
    );
    assert!(matches!(result, Err(PipelineError::UnknownBatch { .. })));
}

#[test]
fn reports_export_to_structured_formats_only() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);
    let report = validate(
        &loaded.engine,
        &loaded.batch,
        &loaded.schemas,
        &loaded.unified,
        &ValidationOptions::default(),
    )
    .unwrap();

    let json_path = workspace.path().join("report.json");
    export_report(&report, "json", &json_path).unwrap();
    let raw = std::fs::read_to_string(&json_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        parsed["batch_id"].as_str().unwrap(),
        loaded.batch.id.to_string()
    );

    let csv_path = workspace.path().join("report.csv");
    export_report(&report, "csv", &csv_path).unwrap();
    assert!(std::fs::read_to_string(&csv_path).unwrap().starts_with("rule,"));

    let yaml_path = workspace.path().join("report.yaml");
    export_report(&report, "yaml", &yaml_path).unwrap();

    // Unsupported formats fail before touching the filesystem.
    let bogus_path = workspace.path().join("report.parquet");
    assert!(matches!(
        export_report(&report, "parquet", &bogus_path),
        Err(PipelineError::UnsupportedFormat(_))
    ));
    assert!(!bogus_path.exists());
}

#[test]
fn read_apis_expose_tables_and_schema_descriptions() {
    let workspace = TestWorkspace::new();
    let loaded = load_scenario(&workspace);

    let store = loaded.engine.store().lock().unwrap();
    let tables = store.list_tables().unwrap();
    assert!(tables.contains(&"survey_facts".to_string()));

    let info = store.schema_info(Some("survey_facts")).unwrap();
    assert!(info.contains("survey_facts"));
    assert!(info.contains("tot_emp"));

    assert!(matches!(
        store.schema_info(Some("no_such_table")),
        Err(PipelineError::UnknownTable { .. })
    ));
}
