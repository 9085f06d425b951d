mod common;

use common::TestWorkspace;
use oews_warehouse::{
    ConsolidateOptions, PipelineError, SchemaRegistry, ValueDomain, analyzer, consolidate,
};

#[test]
fn analyzer_infers_survey_domains_and_sentinels() {
    let workspace = TestWorkspace::new();
    workspace.write(
        "wages_2019.csv",
        "\
AREA_TITLE,OCC_CODE,TOT_EMP,H_MEAN,PUBLISHED
Alabama,11-1011,120,55.3,2019-05-14
Alabama,11-1021,#,*,2019-05-14
Alaska,11-1011,80,48.9,
",
    );

    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);
    assert_eq!(schemas.len(), 1);
    let sheet = &schemas[0].sheets[0];
    assert_eq!(sheet.name, "wages_2019");
    assert_eq!(sheet.row_count, 3);

    let by_name = |name: &str| {
        sheet
            .columns
            .iter()
            .find(|column| column.name == name)
            .unwrap_or_else(|| panic!("column {name} missing"))
    };

    assert_eq!(by_name("area_title").domain, ValueDomain::Text);
    assert_eq!(by_name("occ_code").domain, ValueDomain::Text);
    // Suppression markers are tallied, never typed.
    let tot_emp = by_name("tot_emp");
    assert_eq!(tot_emp.domain, ValueDomain::Integer);
    assert_eq!(tot_emp.sentinel_count, 1);
    let h_mean = by_name("h_mean");
    assert_eq!(h_mean.domain, ValueDomain::Decimal);
    assert_eq!(h_mean.sentinel_count, 1);
    let published = by_name("published");
    assert_eq!(published.domain, ValueDomain::Date);
    assert!(published.nullable);
    assert_eq!(by_name("area_title").raw_name, "AREA_TITLE");
}

#[test]
fn metadata_extracts_contribute_no_data_sheets() {
    let workspace = TestWorkspace::new();
    workspace.write(
        "field_descriptions.csv",
        "FIELD,DESCRIPTION\nAREA,Geographic area code\n",
    );
    workspace.write("wages_2019.csv", common::YEAR_A_CSV);

    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);

    let metadata = schemas
        .iter()
        .find(|schema| schema.file == "field_descriptions")
        .unwrap();
    assert!(metadata.sheets.is_empty());

    let data = schemas
        .iter()
        .find(|schema| schema.file == "wages_2019")
        .unwrap();
    assert_eq!(data.sheets.len(), 1);
}

#[test]
fn evolution_detection_flags_drifted_columns() {
    let workspace = TestWorkspace::new();
    common::write_scenario_files(&workspace);

    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);
    let evolved = analyzer::detect_evolution(&schemas);

    assert_eq!(evolved.len(), 1);
    assert_eq!(evolved[0].name, "tot_emp");
    let domains: Vec<ValueDomain> = evolved[0]
        .observed
        .iter()
        .map(|(_, domain)| *domain)
        .collect();
    assert!(domains.contains(&ValueDomain::Integer));
    assert!(domains.contains(&ValueDomain::Decimal));
}

#[test]
fn unified_schema_promotes_and_unions_per_the_lattice() {
    let workspace = TestWorkspace::new();
    common::write_scenario_files(&workspace);

    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);
    let unified = common::build_keyed_schema(&schemas);

    let table = unified.fact_table().unwrap();
    let tot_emp = table.column("tot_emp").unwrap();
    assert_eq!(tot_emp.domain, ValueDomain::Decimal);
    assert!(!tot_emp.nullable);

    let new_col = table.column("new_col").unwrap();
    assert!(new_col.nullable, "absent in year A");

    assert_eq!(unified.source_file_count, 2);
    assert_eq!(unified.promotions.len(), 1);
    assert_eq!(unified.promotions[0].resolved, ValueDomain::Decimal);

    // Every column of every file has exactly one mapping into the table.
    for schema in &schemas {
        let mappings = unified.mappings_for(&schema.content_hash);
        let column_count = schema.columns().count();
        assert_eq!(mappings.len(), column_count);
    }
}

#[test]
fn registry_versions_are_monotonic_and_explicit() {
    let workspace = TestWorkspace::new();
    common::write_scenario_files(&workspace);
    let registry = SchemaRegistry::open(workspace.path().join("registry")).unwrap();

    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);

    let mut first = consolidate::build_unified_schema(
        &schemas[..1],
        "oews",
        &ConsolidateOptions::default(),
    )
    .unwrap();
    assert_eq!(registry.publish(&mut first).unwrap(), 1);

    // Identical structure republished: same version, no new document.
    let mut same = consolidate::build_unified_schema(
        &schemas[..1],
        "oews",
        &ConsolidateOptions::default(),
    )
    .unwrap();
    assert_eq!(registry.publish(&mut same).unwrap(), 1);

    // A structural change (new column from year B) bumps the version.
    let mut second = consolidate::build_unified_schema(
        &schemas,
        "oews",
        &ConsolidateOptions::default(),
    )
    .unwrap();
    assert_eq!(registry.publish(&mut second).unwrap(), 2);
    assert_eq!(registry.versions("oews").unwrap(), vec![1, 2]);
    assert_eq!(registry.latest_version("oews").unwrap(), Some(2));
    assert_eq!(registry.latest_version("unknown").unwrap(), None);

    // Old versions stay addressable; unknown ones fail distinctly.
    let v1 = registry.load("oews", 1).unwrap();
    assert!(v1.fact_table().unwrap().column("new_col").is_none());
    assert!(matches!(
        registry.load("oews", 9),
        Err(PipelineError::UnknownSchemaVersion { version: 9, .. })
    ));
}

#[test]
fn consolidation_never_yields_a_partial_schema() {
    assert!(matches!(
        consolidate::build_unified_schema(&[], "oews", &ConsolidateOptions::default()),
        Err(PipelineError::NoSchemaInput)
    ));

    // A corpus of only metadata extracts has nothing to consolidate.
    let workspace = TestWorkspace::new();
    workspace.write("field_descriptions.csv", "FIELD,DESCRIPTION\nAREA,code\n");
    let files = common::discover_files(workspace.path());
    let schemas = common::analyze_files(&files);
    assert!(matches!(
        consolidate::build_unified_schema(&schemas, "oews", &ConsolidateOptions::default()),
        Err(PipelineError::NoSchemaInput)
    ));
}
