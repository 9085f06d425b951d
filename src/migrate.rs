//! The migration engine: batched, chunked, transactional loading of
//! discovered extracts against a pinned unified schema.
//!
//! A batch pins one schema version and a fixed file set for its whole run.
//! Files fan out across the worker pool; within one file, chunks are
//! processed sequentially in source-row order so duplicate detection
//! tie-breaks deterministically (first occurrence wins under
//! skip-duplicate). The chunk is the atomic unit: it commits fully or not
//! at all, and pause never interrupts one in flight.
//!
//! Key-space decisions serialize on a shared per-table key state, so two
//! files writing concurrently cannot disagree about a duplicate. When files
//! run in parallel, cross-file first-seen order follows chunk commit order;
//! run with one worker when batch-order determinism across files matters.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    analyzer,
    checkpoint::CheckpointToken,
    consolidate::{TableDefinition, UnifiedSchema},
    data,
    discovery::{self, SourceFileInfo, SourceFileStatus},
    domain::ValueDomain,
    error::{PipelineError, Result},
    pool,
    store::{self, DestinationStore, MigrationRow},
    workbook,
};

pub const DEFAULT_CHUNK_SIZE: usize = 5000;
const MAX_RECORDED_ISSUES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// First occurrence wins; later rows with the same key are skipped.
    #[default]
    SkipDuplicate,
    /// Later rows replace previously persisted rows with the same key.
    OverwriteExisting,
    /// Every occurrence is kept under an incremented source version.
    CreateVersion,
    /// Any key collision fails the chunk and the file.
    FailOnConflict,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::SkipDuplicate => "skip-duplicate",
            ConflictPolicy::OverwriteExisting => "overwrite-existing",
            ConflictPolicy::CreateVersion => "create-version",
            ConflictPolicy::FailOnConflict => "fail-on-conflict",
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip-duplicate" => Ok(ConflictPolicy::SkipDuplicate),
            "overwrite-existing" => Ok(ConflictPolicy::OverwriteExisting),
            "create-version" => Ok(ConflictPolicy::CreateVersion),
            "fail-on-conflict" => Ok(ConflictPolicy::FailOnConflict),
            other => Err(PipelineError::BatchSetup {
                reason: format!("Unknown conflict policy '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::RolledBack
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::RolledBack => "rolled_back",
        };
        write!(f, "{token}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    /// Rows per transactional chunk.
    pub chunk_size: usize,
    pub conflict_policy: ConflictPolicy,
    /// Count unconvertible records as failed and keep loading; when off,
    /// one bad record fails the whole file.
    pub skip_invalid_records: bool,
    /// Concurrent per-file migrations within a batch.
    pub max_workers: usize,
    /// Delimiter override for delimited extracts.
    pub delimiter: Option<u8>,
    /// Character encoding for delimited extracts (defaults to utf-8).
    pub input_encoding: Option<String>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        MigrationOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            conflict_policy: ConflictPolicy::default(),
            skip_invalid_records: true,
            max_workers: 4,
            delimiter: None,
            input_encoding: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordIssue {
    pub sheet: String,
    /// 1-based data row within the file (0 for file-level issues).
    pub row: u64,
    pub column: String,
    pub message: String,
}

/// Outcome of migrating one file within one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub file: String,
    pub content_hash: String,
    pub status: SourceFileStatus,
    /// Rows written to the destination table.
    pub processed: u64,
    /// Rows skipped by duplicate detection.
    pub skipped: u64,
    /// Records that could not be converted or whose chunk failed.
    pub failed: u64,
    pub checkpoint: Option<CheckpointToken>,
    pub issues: Vec<RecordIssue>,
}

impl MigrationRecord {
    fn new(file: &SourceFileInfo) -> Self {
        MigrationRecord {
            file: file.name.clone(),
            content_hash: file.content_hash.clone(),
            status: SourceFileStatus::Migrating,
            processed: 0,
            skipped: 0,
            failed: 0,
            checkpoint: None,
            issues: Vec::new(),
        }
    }

    fn push_issue(&mut self, issue: RecordIssue) {
        if self.issues.len() < MAX_RECORDED_ISSUES {
            self.issues.push(issue);
        }
    }

    fn fail(&mut self, issue: RecordIssue) {
        self.push_issue(issue);
        self.status = SourceFileStatus::Failed;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationBatch {
    pub id: Uuid,
    pub schema_name: String,
    pub schema_version: u32,
    /// Fixed membership; immutable once the batch starts.
    pub files: Vec<SourceFileInfo>,
    pub status: BatchStatus,
    pub options: MigrationOptions,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records: Vec<MigrationRecord>,
}

impl MigrationBatch {
    pub fn record_for(&self, content_hash: &str) -> Option<&MigrationRecord> {
        self.records
            .iter()
            .find(|record| record.content_hash == content_hash)
    }

    /// (processed, skipped, failed) across every record.
    pub fn totals(&self) -> (u64, u64, u64) {
        self.records.iter().fold((0, 0, 0), |acc, record| {
            (
                acc.0 + record.processed,
                acc.1 + record.skipped,
                acc.2 + record.failed,
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackHalt {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackReport {
    /// (file, rows removed) in rollback order.
    pub completed: Vec<(String, u64)>,
    /// Set when the rollback halted before finishing every file.
    pub halted: Option<RollbackHalt>,
}

/// Per-table duplicate-detection state: highest persisted version per key.
type KeyState = HashMap<String, u32>;

pub struct MigrationEngine<S: DestinationStore> {
    store: Mutex<S>,
    paused: AtomicBool,
    key_state: Mutex<HashMap<String, KeyState>>,
    /// Last completed record per canonical file name, for incremental
    /// re-migration of changed extracts.
    history: Mutex<HashMap<String, MigrationRecord>>,
    batches: Mutex<HashMap<Uuid, BatchStatus>>,
}

impl<S: DestinationStore> MigrationEngine<S> {
    pub fn new(store: S) -> Self {
        MigrationEngine {
            store: Mutex::new(store),
            paused: AtomicBool::new(false),
            key_state: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Mutex<S> {
        &self.store
    }

    pub fn knows_batch(&self, id: Uuid) -> bool {
        self.batches.lock().expect("batch registry lock").contains_key(&id)
    }

    pub fn batch_status(&self, id: Uuid) -> Option<BatchStatus> {
        self.batches.lock().expect("batch registry lock").get(&id).copied()
    }

    fn register_batch(&self, id: Uuid, status: BatchStatus) {
        self.batches.lock().expect("batch registry lock").insert(id, status);
    }

    /// Cooperative pause: blocks new per-file migrations; whatever is in
    /// flight finishes its current chunk (and file) normally.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Migration paused: no new file migrations will start");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Opens a batch pinned to `schema`. Fails before any write when the
    /// schema is empty or the file list is empty.
    pub fn start_batch(
        &self,
        files: Vec<SourceFileInfo>,
        schema: &UnifiedSchema,
        options: MigrationOptions,
    ) -> Result<MigrationBatch> {
        let table = schema.fact_table()?;
        if table.columns.is_empty() {
            return Err(PipelineError::EmptySchema {
                name: schema.name.clone(),
            });
        }
        if files.is_empty() {
            return Err(PipelineError::BatchSetup {
                reason: "The batch file list is empty".to_string(),
            });
        }
        if options.chunk_size == 0 {
            return Err(PipelineError::BatchSetup {
                reason: "Chunk size must be at least 1".to_string(),
            });
        }

        let seeded = {
            let mut store = self.store.lock().expect("store lock");
            store.ensure_table(table)?;
            store.existing_key_versions(table)?
        };
        self.key_state
            .lock()
            .expect("key state lock")
            .insert(table.name.clone(), seeded);

        let batch = MigrationBatch {
            id: Uuid::new_v4(),
            schema_name: schema.name.clone(),
            schema_version: schema.version,
            files,
            status: BatchStatus::Pending,
            options,
            started_at: None,
            finished_at: None,
            records: Vec::new(),
        };
        self.register_batch(batch.id, BatchStatus::Pending);
        info!(
            "Opened batch {} against schema '{}' v{} with {} file(s)",
            batch.id,
            batch.schema_name,
            batch.schema_version,
            batch.files.len()
        );
        Ok(batch)
    }

    /// Runs (or resumes) every file in the batch that has no record yet.
    pub fn run_batch(&self, batch: &mut MigrationBatch, schema: &UnifiedSchema) -> Result<()> {
        if batch.schema_name != schema.name || batch.schema_version != schema.version {
            return Err(PipelineError::BatchSetup {
                reason: format!(
                    "Batch {} is pinned to schema '{}' v{} but was given '{}' v{}",
                    batch.id, batch.schema_name, batch.schema_version, schema.name, schema.version
                ),
            });
        }
        if batch.status.is_terminal() {
            return Err(PipelineError::BatchSetup {
                reason: format!("Batch {} is already {}", batch.id, batch.status),
            });
        }

        batch.status = BatchStatus::Running;
        self.register_batch(batch.id, BatchStatus::Running);
        if batch.started_at.is_none() {
            batch.started_at = Some(Utc::now());
        }

        let remaining: Vec<SourceFileInfo> = batch
            .files
            .iter()
            .filter(|file| batch.record_for(&file.content_hash).is_none())
            .cloned()
            .collect();

        let batch_id = batch.id;
        let options = batch.options.clone();
        let outcomes = pool::map_parallel(
            remaining,
            options.max_workers,
            |_, file: SourceFileInfo| {
                if self.is_paused() {
                    debug!("Skipping {:?}: migration is paused", file.path);
                    return None;
                }
                let record = match self.migrate_file(&file, schema, batch_id, &options) {
                    Ok(record) => record,
                    Err(err) => {
                        // Resource-level failure for this file; captured so
                        // sibling files keep loading.
                        let mut record = MigrationRecord::new(&file);
                        record.fail(RecordIssue {
                            sheet: String::new(),
                            row: 0,
                            column: String::new(),
                            message: err.to_string(),
                        });
                        record
                    }
                };
                Some(record)
            },
        );

        let mut deferred = false;
        for outcome in outcomes {
            match outcome {
                Some(record) => {
                    if let Some(file) = batch
                        .files
                        .iter_mut()
                        .find(|file| file.content_hash == record.content_hash)
                        && let Err(err) = file.set_status(record.status)
                    {
                        warn!("Status update for '{}' rejected: {err}", record.file);
                    }
                    batch.records.push(record);
                }
                None => deferred = true,
            }
        }

        let any_failed = batch
            .records
            .iter()
            .any(|record| record.status == SourceFileStatus::Failed);
        batch.status = if deferred {
            BatchStatus::Paused
        } else if any_failed {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        if batch.status.is_terminal() {
            batch.finished_at = Some(Utc::now());
        }
        self.register_batch(batch.id, batch.status);

        let (processed, skipped, failed) = batch.totals();
        info!(
            "Batch {} is {}: {} row(s) written, {} skipped, {} failed",
            batch.id, batch.status, processed, skipped, failed
        );
        Ok(())
    }

    /// Migrates one file against the pinned schema.
    ///
    /// Per-record and per-chunk problems are captured in the returned
    /// [`MigrationRecord`]; only resource-level failures (unknown batch,
    /// store loss) surface as `Err`.
    pub fn migrate_file(
        &self,
        file: &SourceFileInfo,
        schema: &UnifiedSchema,
        batch_id: Uuid,
        options: &MigrationOptions,
    ) -> Result<MigrationRecord> {
        if !self.knows_batch(batch_id) {
            return Err(PipelineError::UnknownBatch {
                batch_id: batch_id.to_string(),
            });
        }
        let table = schema.fact_table()?;
        let mut record = MigrationRecord::new(file);

        if !discovery::validate_accessibility(&file.path) {
            record.fail(RecordIssue {
                sheet: String::new(),
                row: 0,
                column: String::new(),
                message: format!("{:?} failed the accessibility pre-flight", file.path),
            });
            return Ok(record);
        }

        self.supersede_prior_rows(file, table, options)?;
        record.checkpoint = Some(self.create_rollback_checkpoint(file, table)?);

        let contents = workbook::read_workbook(
            &file.path,
            options.delimiter,
            options.input_encoding.as_deref(),
        )?;
        for issue in &contents.errors {
            record.push_issue(RecordIssue {
                sheet: issue.sheet.clone(),
                row: 0,
                column: String::new(),
                message: issue.message.clone(),
            });
        }

        let mut source_row = 0u64;
        let mut buffer: Vec<MigrationRow> = Vec::with_capacity(options.chunk_size);
        for sheet in &contents.sheets {
            if analyzer::is_metadata_sheet(&sheet.name) {
                continue;
            }
            let plan = match build_sheet_plan(sheet, file, schema, table) {
                Ok(plan) => plan,
                Err(message) => {
                    record.fail(RecordIssue {
                        sheet: sheet.name.clone(),
                        row: 0,
                        column: String::new(),
                        message,
                    });
                    return Ok(record);
                }
            };

            for row in &sheet.rows {
                source_row += 1;
                let mut values: Vec<Option<crate::data::Value>> = vec![None; table.columns.len()];
                let mut row_ok = true;
                for (cell_idx, target) in plan.iter().enumerate() {
                    let Some((column_idx, domain, target_name)) = target else {
                        continue;
                    };
                    let cell = row.get(cell_idx).unwrap_or(&workbook::CellValue::Empty);
                    match data::convert_cell(cell, *domain) {
                        Ok(converted) => values[*column_idx] = converted,
                        Err(message) => {
                            record.failed += 1;
                            record.push_issue(RecordIssue {
                                sheet: sheet.name.clone(),
                                row: source_row,
                                column: target_name.clone(),
                                message: message.clone(),
                            });
                            if !options.skip_invalid_records {
                                record.status = SourceFileStatus::Failed;
                                return Ok(record);
                            }
                            row_ok = false;
                            break;
                        }
                    }
                }
                if !row_ok {
                    continue;
                }
                buffer.push(MigrationRow {
                    source_hash: file.content_hash.clone(),
                    source_row,
                    source_version: 1,
                    values,
                });
                if buffer.len() >= options.chunk_size {
                    let chunk = std::mem::take(&mut buffer);
                    if !self.write_chunk(table, chunk, options, &mut record)? {
                        return Ok(record);
                    }
                }
            }
        }
        if !buffer.is_empty() && !self.write_chunk(table, buffer, options, &mut record)? {
            return Ok(record);
        }

        record.status = SourceFileStatus::Completed;
        self.history
            .lock()
            .expect("history lock")
            .insert(record.file.clone(), record.clone());
        info!(
            "Migrated {:?}: {} written, {} skipped, {} failed",
            file.path, record.processed, record.skipped, record.failed
        );
        Ok(record)
    }

    /// Incremental re-migration: a file whose content hash changed relative
    /// to its last completed record is an update. Under overwrite-existing
    /// its prior rows are removed before the new rows land.
    fn supersede_prior_rows(
        &self,
        file: &SourceFileInfo,
        table: &TableDefinition,
        options: &MigrationOptions,
    ) -> Result<()> {
        let prior_hash = {
            let history = self.history.lock().expect("history lock");
            history
                .get(&file.name)
                .filter(|prior| {
                    prior.status == SourceFileStatus::Completed
                        && prior.content_hash != file.content_hash
                })
                .map(|prior| prior.content_hash.clone())
        };
        let Some(prior_hash) = prior_hash else {
            return Ok(());
        };
        if options.conflict_policy == ConflictPolicy::OverwriteExisting {
            let removed = {
                let mut store = self.store.lock().expect("store lock");
                store.delete_source_rows(&table.name, &prior_hash)?
            };
            // The superseded keys must not keep blocking the replacement
            // rows, so the per-table key state is reseeded.
            let reseeded = {
                let store = self.store.lock().expect("store lock");
                store.existing_key_versions(table)?
            };
            self.key_state
                .lock()
                .expect("key state lock")
                .insert(table.name.clone(), reseeded);
            info!(
                "Superseded {} prior row(s) of '{}' (content changed)",
                removed, file.name
            );
        } else {
            warn!(
                "'{}' changed since its last completed migration; prior rows are retained under policy {}",
                file.name, options.conflict_policy
            );
        }
        Ok(())
    }

    /// Applies duplicate detection and writes one chunk transactionally.
    /// Returns `false` when the chunk failed and the file should stop.
    fn write_chunk(
        &self,
        table: &TableDefinition,
        chunk: Vec<MigrationRow>,
        options: &MigrationOptions,
        record: &mut MigrationRecord,
    ) -> Result<bool> {
        let chunk_len = chunk.len() as u64;
        let has_keys = !table.primary_key.is_empty();
        let key_columns: Vec<usize> = table
            .primary_key
            .iter()
            .filter_map(|key| table.columns.iter().position(|column| &column.name == key))
            .collect();

        // Key-space decisions and the chunk write happen under the key
        // state lock, serializing concurrent writers on the primary-key
        // space.
        let mut key_state = self.key_state.lock().expect("key state lock");
        let state = key_state.entry(table.name.clone()).or_default();

        let mut to_insert: Vec<MigrationRow> = Vec::with_capacity(chunk.len());
        let mut pending: HashMap<String, u32> = HashMap::new();
        let mut overwrites: Vec<Vec<Option<String>>> = Vec::new();

        for mut row in chunk {
            if !has_keys {
                to_insert.push(row);
                continue;
            }
            let key_parts: Vec<Option<String>> = key_columns
                .iter()
                .map(|idx| row.values[*idx].as_ref().map(|value| value.canonical()))
                .collect();
            let key = store::join_key(&key_parts);
            let existing = pending.get(&key).or_else(|| state.get(&key)).copied();
            match options.conflict_policy {
                ConflictPolicy::SkipDuplicate => {
                    if existing.is_some() {
                        record.skipped += 1;
                    } else {
                        pending.insert(key, 1);
                        to_insert.push(row);
                    }
                }
                ConflictPolicy::OverwriteExisting => {
                    if existing.is_some() {
                        if state.contains_key(&key) {
                            overwrites.push(key_parts);
                        }
                        // Drop an earlier same-key row from this chunk:
                        // last occurrence wins.
                        to_insert.retain(|candidate| {
                            let candidate_parts: Vec<Option<String>> = key_columns
                                .iter()
                                .map(|idx| {
                                    candidate.values[*idx]
                                        .as_ref()
                                        .map(|value| value.canonical())
                                })
                                .collect();
                            store::join_key(&candidate_parts) != key
                        });
                    }
                    pending.insert(key, 1);
                    to_insert.push(row);
                }
                ConflictPolicy::CreateVersion => {
                    let version = existing.map(|current| current + 1).unwrap_or(1);
                    row.source_version = version;
                    pending.insert(key, version);
                    to_insert.push(row);
                }
                ConflictPolicy::FailOnConflict => {
                    if existing.is_some() {
                        record.failed += chunk_len;
                        record.fail(RecordIssue {
                            sheet: String::new(),
                            row: row.source_row,
                            column: table.primary_key.join("+"),
                            message: PipelineError::DuplicateKey {
                                key: key_parts
                                    .iter()
                                    .map(|part| part.as_deref().unwrap_or("null"))
                                    .collect::<Vec<_>>()
                                    .join(", "),
                            }
                            .to_string(),
                        });
                        return Ok(false);
                    }
                    pending.insert(key, 1);
                    to_insert.push(row);
                }
            }
        }

        let written = {
            let mut store = self.store.lock().expect("store lock");
            if !overwrites.is_empty() {
                store.delete_rows_by_key(table, &overwrites)?;
            }
            store.insert_chunk(table, &to_insert)
        };
        match written {
            Ok(outcome) => {
                record.processed += outcome.inserted;
                // The chunk committed; its keys become visible to every
                // other writer.
                for (key, version) in pending {
                    let entry = state.entry(key).or_insert(0);
                    *entry = (*entry).max(version);
                }
                Ok(true)
            }
            Err(err) => {
                record.failed += to_insert.len() as u64;
                record.fail(RecordIssue {
                    sheet: String::new(),
                    row: 0,
                    column: String::new(),
                    message: format!("Chunk write failed and was rolled back: {err}"),
                });
                error!("Chunk write failed for '{}': {err}", record.file);
                Ok(false)
            }
        }
    }

    /// Records a checkpoint at the current write high-water mark, before
    /// the file's first write: everything the file contributes will sit
    /// above the mark, so undoing it is a range delete.
    pub fn create_rollback_checkpoint(
        &self,
        file: &SourceFileInfo,
        table: &TableDefinition,
    ) -> Result<CheckpointToken> {
        let mut store = self.store.lock().expect("store lock");
        let mark = store.max_row_id(&table.name)?;
        let token = CheckpointToken::encode(&table.name, &file.content_hash, mark)?;
        store.record_checkpoint(&token, &token.decode()?)?;
        Ok(token)
    }

    /// Undoes exactly one file's contribution using its checkpoint.
    /// Returns the number of rows removed; zero is a successful no-op.
    pub fn rollback_file(&self, checkpoint: &CheckpointToken) -> Result<u64> {
        let payload = checkpoint.decode()?;
        let removed = {
            let mut store = self.store.lock().expect("store lock");
            if !store.table_exists(&payload.table)? {
                return Err(PipelineError::InvalidCheckpoint {
                    reason: format!("Table '{}' does not exist", payload.table),
                });
            }
            store.delete_checkpointed_rows(&payload)?
        };
        // Rolled-back keys must not linger in the duplicate-detection
        // state; the next batch reseeds from the store.
        self.key_state
            .lock()
            .expect("key state lock")
            .remove(&payload.table);
        info!(
            "Rolled back {} row(s) of source {} from '{}'",
            removed, payload.source_hash, payload.table
        );
        Ok(removed)
    }

    /// Rolls back every completed file of the batch in reverse completion
    /// order. Halts with a report on the first irrecoverable error instead
    /// of leaving a silent partial rollback.
    pub fn rollback_batch(&self, batch: &mut MigrationBatch) -> Result<RollbackReport> {
        if !self.knows_batch(batch.id) {
            return Err(PipelineError::UnknownBatch {
                batch_id: batch.id.to_string(),
            });
        }
        let mut report = RollbackReport::default();
        let order: Vec<usize> = (0..batch.records.len()).rev().collect();
        for idx in order {
            let (file_name, checkpoint) = {
                let record = &batch.records[idx];
                if record.status != SourceFileStatus::Completed
                    && record.status != SourceFileStatus::Failed
                {
                    continue;
                }
                (record.file.clone(), record.checkpoint.clone())
            };
            let Some(checkpoint) = checkpoint else {
                // No checkpoint means nothing was ever written.
                continue;
            };
            match self.rollback_file(&checkpoint) {
                Ok(removed) => {
                    report.completed.push((file_name.clone(), removed));
                    let record = &mut batch.records[idx];
                    record.status = SourceFileStatus::RolledBack;
                    if let Some(file) = batch
                        .files
                        .iter_mut()
                        .find(|file| file.content_hash == record.content_hash)
                        && let Err(err) = file.set_status(SourceFileStatus::RolledBack)
                    {
                        warn!("Status update for '{}' rejected: {err}", record.file);
                    }
                }
                Err(err) => {
                    error!(
                        "Rollback of batch {} halted at '{}': {err}",
                        batch.id, file_name
                    );
                    report.halted = Some(RollbackHalt {
                        file: file_name,
                        reason: err.to_string(),
                    });
                    batch.status = BatchStatus::Failed;
                    self.register_batch(batch.id, BatchStatus::Failed);
                    return Ok(report);
                }
            }
        }
        batch.status = BatchStatus::RolledBack;
        batch.finished_at = Some(Utc::now());
        self.register_batch(batch.id, BatchStatus::RolledBack);
        self.history.lock().expect("history lock").retain(|_, record| {
            !batch
                .records
                .iter()
                .any(|rolled| rolled.content_hash == record.content_hash)
        });
        info!(
            "Rolled back batch {}: {} file(s), {} row(s) removed",
            batch.id,
            report.completed.len(),
            report.completed.iter().map(|(_, rows)| rows).sum::<u64>()
        );
        Ok(report)
    }
}

/// Resolves each sheet column to its target column and domain.
///
/// Resolution prefers the pinned schema's explicit mappings for this file's
/// content hash and falls back to normalized-name lookup, so a re-exported
/// file with identical structure still maps. A column with no target at all
/// violates the mapping invariant and fails the file.
pub(crate) fn build_sheet_plan(
    sheet: &workbook::SheetData,
    file: &SourceFileInfo,
    schema: &UnifiedSchema,
    table: &TableDefinition,
) -> std::result::Result<Vec<Option<(usize, ValueDomain, String)>>, String> {
    let mappings = schema.mappings_for(&file.content_hash);
    let mut plan = Vec::with_capacity(sheet.headers.len());
    for header in &sheet.headers {
        let target_name = mappings
            .iter()
            .find(|mapping| mapping.sheet == sheet.name && &mapping.source_column == header)
            .map(|mapping| mapping.target_column.clone())
            .unwrap_or_else(|| data::normalize_column_name(header));
        match table
            .columns
            .iter()
            .position(|column| column.name == target_name)
        {
            Some(idx) => {
                plan.push(Some((idx, table.columns[idx].domain, target_name)));
            }
            None => {
                return Err(format!(
                    "Column '{header}' in sheet '{}' has no mapping into table '{}'",
                    sheet.name, table.name
                ));
            }
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_policy_tokens_round_trip() {
        for policy in [
            ConflictPolicy::SkipDuplicate,
            ConflictPolicy::OverwriteExisting,
            ConflictPolicy::CreateVersion,
            ConflictPolicy::FailOnConflict,
        ] {
            let parsed: ConflictPolicy = policy.as_str().parse().unwrap();
            assert_eq!(parsed, policy);
        }
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn batch_status_terminality() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::RolledBack.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(!BatchStatus::Paused.is_terminal());
    }
}
