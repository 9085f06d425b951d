#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};

use oews_warehouse::{
    AnalyzerOptions, ConsolidateOptions, DiscoveryOptions, FileSchema, SourceFileInfo,
    UnifiedSchema, analyzer, consolidate, discovery,
};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the
    /// path. Intermediate directories are created as needed.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }
}

/// Survey extract for year A: integral employment counts.
pub const YEAR_A_CSV: &str = "\
AREA,OCC_CODE,TOT_EMP
0100000,11-1011,120
0100000,11-1021,340
0200000,11-1011,80
";

/// Survey extract for year B: fractional counts, a new column, and one key
/// overlapping year A.
pub const YEAR_B_CSV: &str = "\
AREA,OCC_CODE,TOT_EMP,NEW_COL
0100000,11-1011,125.5,extra
0300000,11-1011,60.25,thing
";

pub fn write_scenario_files(workspace: &TestWorkspace) -> (PathBuf, PathBuf) {
    let year_a = workspace.write("wages_2019.csv", YEAR_A_CSV);
    let year_b = workspace.write("wages_2020.csv", YEAR_B_CSV);
    (year_a, year_b)
}

pub fn discover_files(root: &Path) -> Vec<SourceFileInfo> {
    discovery::discover(root, &DiscoveryOptions::default())
        .expect("discovery succeeds")
        .files
}

pub fn analyze_files(files: &[SourceFileInfo]) -> Vec<FileSchema> {
    let outcome = analyzer::analyze_all(files, &AnalyzerOptions::default());
    assert!(
        outcome.errors.is_empty(),
        "unexpected analysis failures: {:?}",
        outcome.errors
    );
    outcome.schemas
}

/// Consolidates with the survey's natural key, (area, occ_code).
pub fn build_keyed_schema(schemas: &[FileSchema]) -> UnifiedSchema {
    let options = ConsolidateOptions {
        primary_key: vec!["area".to_string(), "occ_code".to_string()],
        ..ConsolidateOptions::default()
    };
    consolidate::build_unified_schema(schemas, "oews", &options).expect("consolidation succeeds")
}
