//! Corpus discovery: walking the extract tree and fingerprinting files.
//!
//! Discovery enumerates candidate extracts under a root, filters them by
//! extension, name pattern, and size, then fans per-file metadata extraction
//! (SHA-256 content hash plus a structural probe) across the worker pool.
//! Identity is the content hash, never the filename: a re-exported file with
//! new contents is a new logical version.
//!
//! Per-file problems are recorded as [`DiscoveryIssue`]s and never stop the
//! scan; only an unreadable root is fatal.

use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{PipelineError, Result},
    pool, workbook,
};

const HASH_BUFFER_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    /// Descend into subdirectories.
    pub recurse: bool,
    /// Per-file size ceiling; larger files are skipped with a recorded issue.
    pub max_size: u64,
    /// Accepted file extensions, compared case-insensitively.
    pub extensions: Vec<String>,
    /// Regex patterns matched against file names; matches are skipped.
    pub exclude_patterns: Vec<String>,
    pub max_workers: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            recurse: true,
            max_size: DEFAULT_MAX_FILE_SIZE,
            extensions: vec!["xlsx".to_string(), "csv".to_string()],
            exclude_patterns: Vec::new(),
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFileStatus {
    Discovered,
    Analyzing,
    Migrating,
    Completed,
    Failed,
    RolledBack,
}

impl SourceFileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFileStatus::Discovered => "discovered",
            SourceFileStatus::Analyzing => "analyzing",
            SourceFileStatus::Migrating => "migrating",
            SourceFileStatus::Completed => "completed",
            SourceFileStatus::Failed => "failed",
            SourceFileStatus::RolledBack => "rolled_back",
        }
    }

    fn forward_rank(self) -> Option<u8> {
        match self {
            SourceFileStatus::Discovered => Some(0),
            SourceFileStatus::Analyzing => Some(1),
            SourceFileStatus::Migrating => Some(2),
            SourceFileStatus::Completed => Some(3),
            // Terminal exits reachable from any state.
            SourceFileStatus::Failed | SourceFileStatus::RolledBack => None,
        }
    }
}

impl std::fmt::Display for SourceFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFileInfo {
    pub path: PathBuf,
    /// File stem; display identity only. The content hash is the real one.
    pub name: String,
    pub size: u64,
    pub content_hash: String,
    pub sheet_count: usize,
    pub modified: Option<DateTime<Utc>>,
    pub status: SourceFileStatus,
}

impl SourceFileInfo {
    /// Advances the lifecycle status. Forward transitions must be monotonic;
    /// `Failed` and `RolledBack` are reachable from anywhere.
    pub fn set_status(&mut self, next: SourceFileStatus) -> Result<()> {
        match (self.status.forward_rank(), next.forward_rank()) {
            (_, None) => {
                self.status = next;
                Ok(())
            }
            (Some(current), Some(target)) if target >= current => {
                self.status = next;
                Ok(())
            }
            _ => Err(PipelineError::InvalidStatus {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryIssue {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct DiscoveryResult {
    pub files: Vec<SourceFileInfo>,
    pub errors: Vec<DiscoveryIssue>,
    pub total_size: u64,
    pub duration: Duration,
}

/// Scans `root` and returns the fingerprinted file set.
pub fn discover(root: &Path, options: &DiscoveryOptions) -> Result<DiscoveryResult> {
    let started = Instant::now();
    let excludes = compile_excludes(&options.exclude_patterns)?;

    let mut candidates = Vec::new();
    let mut errors = Vec::new();
    walk_root(root, options, &excludes, &mut candidates, &mut errors)?;
    candidates.sort();
    debug!(
        "Discovery found {} candidate file(s) under {:?}",
        candidates.len(),
        root
    );

    let probed = pool::map_parallel(candidates, options.max_workers, |_, path: PathBuf| {
        probe_file(&path, options.max_size)
    });

    let mut files = Vec::new();
    let mut total_size = 0u64;
    for outcome in probed {
        match outcome {
            Ok(info) => {
                total_size += info.size;
                files.push(info);
            }
            Err(issue) => errors.push(issue),
        }
    }

    let duration = started.elapsed();
    info!(
        "Discovered {} file(s) ({} byte(s)) with {} issue(s) in {:?}",
        files.len(),
        total_size,
        errors.len(),
        duration
    );
    Ok(DiscoveryResult {
        files,
        errors,
        total_size,
        duration,
    })
}

/// Pre-flight guard shared with the migration engine: the file must exist,
/// be readable, and pass the structural probe.
pub fn validate_accessibility(path: &Path) -> bool {
    if File::open(path).is_err() {
        return false;
    }
    workbook::sheet_count(path).is_ok()
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|pattern| Ok(Regex::new(pattern)?)).collect()
}

fn walk_root(
    root: &Path,
    options: &DiscoveryOptions,
    excludes: &[Regex],
    candidates: &mut Vec<PathBuf>,
    errors: &mut Vec<DiscoveryIssue>,
) -> Result<()> {
    let entries = std::fs::read_dir(root).map_err(|err| PipelineError::RootUnreadable {
        path: root.to_path_buf(),
        source: err,
    })?;
    let mut pending = vec![entries];

    while let Some(entries) = pending.pop() {
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    errors.push(DiscoveryIssue {
                        path: root.to_path_buf(),
                        reason: format!("Unreadable directory entry: {err}"),
                    });
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                if options.recurse {
                    match std::fs::read_dir(&path) {
                        Ok(nested) => pending.push(nested),
                        Err(err) => errors.push(DiscoveryIssue {
                            path: path.clone(),
                            reason: format!("Unreadable directory: {err}"),
                        }),
                    }
                }
                continue;
            }
            if !accepts_extension(&path, &options.extensions) {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            if excludes.iter().any(|pattern| pattern.is_match(name)) {
                debug!("Excluding {:?} by pattern", path);
                continue;
            }
            candidates.push(path);
        }
    }
    Ok(())
}

fn accepts_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            extensions
                .iter()
                .any(|accepted| accepted.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

fn probe_file(path: &Path, max_size: u64) -> std::result::Result<SourceFileInfo, DiscoveryIssue> {
    let issue = |reason: String| DiscoveryIssue {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|err| issue(format!("Unreadable file: {err}")))?;
    let size = metadata.len();
    if size > max_size {
        return Err(issue(format!(
            "File size {size} exceeds the configured limit of {max_size} byte(s)"
        )));
    }
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    let content_hash =
        hash_file(path).map_err(|err| issue(format!("Failed to hash contents: {err}")))?;
    let sheet_count = workbook::sheet_count(path)
        .map_err(|err| issue(format!("Structural probe failed: {err}")))?;

    Ok(SourceFileInfo {
        name: workbook::file_stem(path),
        path: path.to_path_buf(),
        size,
        content_hash,
        sheet_count,
        modified,
        status: SourceFileStatus::Discovered,
    })
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_BYTES];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(rendered, "{byte:02x}");
    }
    Ok(rendered)
}

/// Continuous-discovery hook: a polling thread that re-runs [`discover`] and
/// reports files whose content hash is new or changed. Callers that skip the
/// watcher poll [`discover`] themselves.
pub struct FileWatcher {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn watch<F>(
        root: &Path,
        options: DiscoveryOptions,
        interval: Duration,
        callback: F,
    ) -> Result<FileWatcher>
    where
        F: Fn(&SourceFileInfo) + Send + 'static,
    {
        // Fail fast on a bad root instead of from inside the thread.
        let initial = discover(root, &options)?;
        let mut seen: HashMap<PathBuf, String> = initial
            .files
            .iter()
            .map(|file| (file.path.clone(), file.content_hash.clone()))
            .collect();

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let root = root.to_path_buf();
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                match discover(&root, &options) {
                    Ok(result) => {
                        for file in &result.files {
                            let changed = seen
                                .get(&file.path)
                                .map(|hash| hash != &file.content_hash)
                                .unwrap_or(true);
                            if changed {
                                seen.insert(file.path.clone(), file.content_hash.clone());
                                callback(file);
                            }
                        }
                    }
                    Err(err) => warn!("Watcher rescan of {:?} failed: {err}", root),
                }
            }
        });

        Ok(FileWatcher {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        let mut file = SourceFileInfo {
            path: PathBuf::from("wages_2019.csv"),
            name: "wages_2019".to_string(),
            size: 10,
            content_hash: "abc".to_string(),
            sheet_count: 1,
            modified: None,
            status: SourceFileStatus::Discovered,
        };
        file.set_status(SourceFileStatus::Analyzing).unwrap();
        file.set_status(SourceFileStatus::Migrating).unwrap();
        assert!(file.set_status(SourceFileStatus::Discovered).is_err());
        file.set_status(SourceFileStatus::Failed).unwrap();
        assert_eq!(file.status, SourceFileStatus::Failed);
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        let extensions = vec!["xlsx".to_string(), "csv".to_string()];
        assert!(accepts_extension(Path::new("a/b/wages.CSV"), &extensions));
        assert!(accepts_extension(Path::new("wages.xlsx"), &extensions));
        assert!(!accepts_extension(Path::new("wages.parquet"), &extensions));
        assert!(!accepts_extension(Path::new("wages"), &extensions));
    }

    #[test]
    fn bad_exclude_pattern_is_a_usage_error() {
        assert!(compile_excludes(&["[".to_string()]).is_err());
        assert!(compile_excludes(&["^~\\$".to_string()]).is_ok());
    }
}
