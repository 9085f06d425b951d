//! Destination store abstraction and the embedded SQLite implementation.
//!
//! The migration engine and validation service only ever talk to
//! [`DestinationStore`]: table existence/creation, chunked parameterized
//! inserts committed as one transaction, checkpoint-scoped row deletion,
//! duplicate scans, and a narrow read-only query surface. [`SqliteStore`]
//! is the embedded dialect; a client-server dialect can slot in behind the
//! same trait.
//!
//! Every fact table carries three bookkeeping columns next to the survey
//! columns: `row_id` (append-only write log position), `source_hash` (the
//! owning file's content identity), `source_row` (position in the source
//! sheet), and `source_version` (conflict-policy versioning). Rollback of
//! one file is a range delete over (`source_hash`, `row_id`).

use std::collections::HashMap;
use std::path::Path;

use itertools::Itertools;
use log::debug;
use rusqlite::{Connection, params, params_from_iter, types};

use crate::{
    checkpoint::{CheckpointPayload, CheckpointToken},
    consolidate::TableDefinition,
    data::Value,
    domain::ValueDomain,
    error::{PipelineError, Result},
};

/// Separator bytes for rendered key tuples. Unit separator between parts,
/// NUL standing in for null so `("a", null)` and `("a", "")` stay distinct.
const KEY_SEPARATOR: char = '\u{1f}';
const KEY_NULL: &str = "\u{0}";

/// Joins rendered key parts into the canonical key string used for
/// duplicate detection and audits.
pub fn join_key(parts: &[Option<String>]) -> String {
    parts
        .iter()
        .map(|part| part.as_deref().unwrap_or(KEY_NULL))
        .join(&KEY_SEPARATOR.to_string())
}

/// One converted row bound for a fact table. `values` aligns with
/// [`TableDefinition::columns`].
#[derive(Debug, Clone)]
pub struct MigrationRow {
    pub source_hash: String,
    pub source_row: u64,
    pub source_version: u32,
    pub values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, Copy)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub first_row_id: i64,
    pub last_row_id: i64,
}

/// One persisted row read back for auditing, values rendered canonically.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub row_id: i64,
    pub source_hash: String,
    pub source_row: u64,
    pub source_version: u32,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

pub trait DestinationStore: Send {
    fn ensure_table(&mut self, table: &TableDefinition) -> Result<()>;
    fn table_exists(&self, name: &str) -> Result<bool>;

    /// Current write high-water mark (0 for an empty table).
    fn max_row_id(&self, table: &str) -> Result<i64>;

    /// Writes the chunk in a single transaction: all rows or none.
    fn insert_chunk(&mut self, table: &TableDefinition, rows: &[MigrationRow])
    -> Result<InsertOutcome>;

    /// Range delete of one file's contribution above the checkpoint mark.
    fn delete_checkpointed_rows(&mut self, payload: &CheckpointPayload) -> Result<u64>;

    /// Removes every row a source file ever contributed (supersede path).
    fn delete_source_rows(&mut self, table: &str, source_hash: &str) -> Result<u64>;

    /// Removes all rows matching the given key tuples (overwrite path).
    fn delete_rows_by_key(&mut self, table: &TableDefinition, keys: &[Vec<Option<String>>])
    -> Result<u64>;

    fn count_source_rows(&self, table: &str, source_hash: &str) -> Result<u64>;

    /// Highest `source_version` per key currently persisted.
    fn existing_key_versions(&self, table: &TableDefinition) -> Result<HashMap<String, u32>>;

    fn scan_rows(&self, table: &TableDefinition, source_hash: Option<&str>)
    -> Result<Vec<StoredRow>>;

    /// Keys appearing more than once, with their multiplicity.
    fn duplicate_keys(&self, table: &TableDefinition) -> Result<Vec<(String, u64)>>;

    /// (key, version) pairs appearing more than once.
    fn duplicate_key_versions(&self, table: &TableDefinition) -> Result<Vec<(String, u64)>>;

    /// Append-only checkpoint ledger.
    fn record_checkpoint(&mut self, token: &CheckpointToken, payload: &CheckpointPayload)
    -> Result<()>;
    fn latest_checkpoint(&self, table: &str, source_hash: &str)
    -> Result<Option<CheckpointToken>>;

    fn list_tables(&self) -> Result<Vec<String>>;
    fn schema_info(&self, table: Option<&str>) -> Result<String>;

    /// Executes a non-mutating statement; anything else is rejected before
    /// execution.
    fn query_read_only(&self, sql: &str) -> Result<QueryResult>;
}

fn sql_type(domain: ValueDomain) -> &'static str {
    match domain {
        ValueDomain::Integer | ValueDomain::Boolean => "INTEGER",
        // Decimals persist as canonical text to stay exact.
        ValueDomain::Decimal
        | ValueDomain::Text
        | ValueDomain::LongText
        | ValueDomain::Date
        | ValueDomain::DateTime => "TEXT",
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_to_sql(value: Option<&Value>) -> types::Value {
    match value {
        None => types::Value::Null,
        Some(Value::Integer(i)) => types::Value::Integer(*i),
        Some(Value::Boolean(b)) => types::Value::Integer(i64::from(*b)),
        Some(other) => types::Value::Text(other.canonical()),
    }
}

/// Renders a stored cell back into the same canonical form the conversion
/// layer produces, so source-vs-target comparison is string equality.
fn render_stored(domain: ValueDomain, value: types::Value) -> Option<String> {
    match value {
        types::Value::Null => None,
        types::Value::Integer(i) => {
            if domain == ValueDomain::Boolean {
                Some((i != 0).to_string())
            } else {
                Some(i.to_string())
            }
        }
        types::Value::Real(f) => Some(f.to_string()),
        types::Value::Text(s) => Some(s),
        types::Value::Blob(bytes) => Some(hex::encode(bytes)),
    }
}

fn render_untyped(value: types::Value) -> Option<String> {
    match value {
        types::Value::Null => None,
        types::Value::Integer(i) => Some(i.to_string()),
        types::Value::Real(f) => Some(f.to_string()),
        types::Value::Text(s) => Some(s),
        types::Value::Blob(bytes) => Some(hex::encode(bytes)),
    }
}

const CHECKPOINT_LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS migration_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    source_hash TEXT NOT NULL,
    token TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Embedded destination store backed by SQLite.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(SqliteStore {
            conn: Connection::open_in_memory()?,
        })
    }

    fn key_select_list(table: &TableDefinition) -> Result<Vec<(String, ValueDomain)>> {
        table
            .primary_key
            .iter()
            .map(|key| {
                table
                    .column(key)
                    .map(|column| (column.name.clone(), column.domain))
                    .ok_or_else(|| PipelineError::UnknownColumn {
                        schema: table.name.clone(),
                        column: key.clone(),
                    })
            })
            .collect()
    }
}

impl DestinationStore for SqliteStore {
    fn ensure_table(&mut self, table: &TableDefinition) -> Result<()> {
        let columns = table
            .columns
            .iter()
            .map(|column| format!("{} {}", quote_ident(&column.name), sql_type(column.domain)))
            .join(",\n    ");
        // Nullability is audited by the validation service rather than
        // enforced in DDL: a suppressed value can surface past the sampled
        // rows of an otherwise dense column.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    row_id INTEGER PRIMARY KEY AUTOINCREMENT,\n    source_hash TEXT NOT NULL,\n    source_row INTEGER NOT NULL,\n    source_version INTEGER NOT NULL DEFAULT 1,\n    {columns}\n)",
            quote_ident(&table.name)
        );
        self.conn.execute_batch(&ddl)?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (source_hash)",
            quote_ident(&format!("idx_{}_source", table.name)),
            quote_ident(&table.name)
        );
        self.conn.execute_batch(&index)?;
        self.conn.execute_batch(CHECKPOINT_LEDGER_DDL)?;
        debug!("Ensured destination table '{}'", table.name);
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        Ok(stmt.exists(params![name])?)
    }

    fn max_row_id(&self, table: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COALESCE(MAX(row_id), 0) FROM {}",
            quote_ident(table)
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    fn insert_chunk(
        &mut self,
        table: &TableDefinition,
        rows: &[MigrationRow],
    ) -> Result<InsertOutcome> {
        if rows.is_empty() {
            let mark = self.max_row_id(&table.name)?;
            return Ok(InsertOutcome {
                inserted: 0,
                first_row_id: mark,
                last_row_id: mark,
            });
        }

        let column_list = std::iter::once("source_hash".to_string())
            .chain(["source_row".to_string(), "source_version".to_string()])
            .chain(table.columns.iter().map(|column| column.name.clone()))
            .map(|name| quote_ident(&name))
            .join(", ");
        let placeholders = (1..=table.columns.len() + 3)
            .map(|idx| format!("?{idx}"))
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
            quote_ident(&table.name)
        );

        let tx = self.conn.transaction()?;
        let mut first_row_id = 0i64;
        let mut last_row_id = 0i64;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                if row.values.len() != table.columns.len() {
                    return Err(PipelineError::BatchSetup {
                        reason: format!(
                            "Row from source row {} carries {} value(s) but table '{}' has {} column(s)",
                            row.source_row,
                            row.values.len(),
                            table.name,
                            table.columns.len()
                        ),
                    });
                }
                let mut bound: Vec<types::Value> = Vec::with_capacity(row.values.len() + 3);
                bound.push(types::Value::Text(row.source_hash.clone()));
                bound.push(types::Value::Integer(row.source_row as i64));
                bound.push(types::Value::Integer(i64::from(row.source_version)));
                bound.extend(row.values.iter().map(|value| value_to_sql(value.as_ref())));
                stmt.execute(params_from_iter(bound))?;
                let row_id = tx.last_insert_rowid();
                if first_row_id == 0 {
                    first_row_id = row_id;
                }
                last_row_id = row_id;
            }
        }
        tx.commit()?;
        Ok(InsertOutcome {
            inserted: rows.len() as u64,
            first_row_id,
            last_row_id,
        })
    }

    fn delete_checkpointed_rows(&mut self, payload: &CheckpointPayload) -> Result<u64> {
        if !self.table_exists(&payload.table)? {
            return Err(PipelineError::InvalidCheckpoint {
                reason: format!("Table '{}' does not exist", payload.table),
            });
        }
        let sql = format!(
            "DELETE FROM {} WHERE source_hash = ?1 AND row_id > ?2",
            quote_ident(&payload.table)
        );
        let deleted = self
            .conn
            .execute(&sql, params![payload.source_hash, payload.high_water_row_id])?;
        Ok(deleted as u64)
    }

    fn delete_source_rows(&mut self, table: &str, source_hash: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE source_hash = ?1",
            quote_ident(table)
        );
        Ok(self.conn.execute(&sql, params![source_hash])? as u64)
    }

    fn delete_rows_by_key(
        &mut self,
        table: &TableDefinition,
        keys: &[Vec<Option<String>>],
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let key_columns = Self::key_select_list(table)?;
        let predicate = key_columns
            .iter()
            .enumerate()
            .map(|(idx, (name, _))| format!("{} IS ?{}", quote_ident(name), idx + 1))
            .join(" AND ");
        let sql = format!(
            "DELETE FROM {} WHERE {predicate}",
            quote_ident(&table.name)
        );

        let tx = self.conn.transaction()?;
        let mut deleted = 0u64;
        {
            let mut stmt = tx.prepare(&sql)?;
            for key in keys {
                let bound: Vec<types::Value> = key_columns
                    .iter()
                    .zip(key.iter())
                    .map(|((_, domain), part)| key_part_to_sql(*domain, part.as_deref()))
                    .collect();
                deleted += stmt.execute(params_from_iter(bound))? as u64;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn count_source_rows(&self, table: &str, source_hash: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE source_hash = ?1",
            quote_ident(table)
        );
        let count: i64 = self.conn.query_row(&sql, params![source_hash], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn existing_key_versions(&self, table: &TableDefinition) -> Result<HashMap<String, u32>> {
        let key_columns = Self::key_select_list(table)?;
        if key_columns.is_empty() {
            return Ok(HashMap::new());
        }
        let select = key_columns
            .iter()
            .map(|(name, _)| quote_ident(name))
            .join(", ");
        let group = select.clone();
        let sql = format!(
            "SELECT {select}, MAX(source_version) FROM {} GROUP BY {group}",
            quote_ident(&table.name)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut versions = HashMap::new();
        while let Some(row) = rows.next()? {
            let parts: Vec<Option<String>> = key_columns
                .iter()
                .enumerate()
                .map(|(idx, (_, domain))| {
                    row.get::<_, types::Value>(idx)
                        .map(|value| render_stored(*domain, value))
                })
                .collect::<std::result::Result<_, rusqlite::Error>>()?;
            let version: i64 = row.get(key_columns.len())?;
            versions.insert(join_key(&parts), version as u32);
        }
        Ok(versions)
    }

    fn scan_rows(
        &self,
        table: &TableDefinition,
        source_hash: Option<&str>,
    ) -> Result<Vec<StoredRow>> {
        let columns = table
            .columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .join(", ");
        let mut sql = format!(
            "SELECT row_id, source_hash, source_row, source_version, {columns} FROM {}",
            quote_ident(&table.name)
        );
        if source_hash.is_some() {
            sql.push_str(" WHERE source_hash = ?1");
        }
        sql.push_str(" ORDER BY row_id");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = match source_hash {
            Some(hash) => stmt.query(params![hash])?,
            None => stmt.query([])?,
        };
        let mut stored = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(table.columns.len());
            for (idx, column) in table.columns.iter().enumerate() {
                let raw: types::Value = row.get(idx + 4)?;
                values.push(render_stored(column.domain, raw));
            }
            stored.push(StoredRow {
                row_id: row.get(0)?,
                source_hash: row.get(1)?,
                source_row: row.get::<_, i64>(2)? as u64,
                source_version: row.get::<_, i64>(3)? as u32,
                values,
            });
        }
        Ok(stored)
    }

    fn duplicate_keys(&self, table: &TableDefinition) -> Result<Vec<(String, u64)>> {
        self.duplicate_scan(table, false)
    }

    fn duplicate_key_versions(&self, table: &TableDefinition) -> Result<Vec<(String, u64)>> {
        self.duplicate_scan(table, true)
    }

    fn record_checkpoint(
        &mut self,
        token: &CheckpointToken,
        payload: &CheckpointPayload,
    ) -> Result<()> {
        self.conn.execute_batch(CHECKPOINT_LEDGER_DDL)?;
        self.conn.execute(
            "INSERT INTO migration_checkpoints (table_name, source_hash, token) VALUES (?1, ?2, ?3)",
            params![payload.table, payload.source_hash, token.as_str()],
        )?;
        Ok(())
    }

    fn latest_checkpoint(
        &self,
        table: &str,
        source_hash: &str,
    ) -> Result<Option<CheckpointToken>> {
        if !self.table_exists("migration_checkpoints")? {
            return Ok(None);
        }
        let mut stmt = self.conn.prepare(
            "SELECT token FROM migration_checkpoints WHERE table_name = ?1 AND source_hash = ?2 ORDER BY id DESC LIMIT 1",
        )?;
        let token: Option<String> = stmt
            .query_row(params![table, source_hash], |row| row.get(0))
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(token.map(CheckpointToken::from))
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(names)
    }

    fn schema_info(&self, table: Option<&str>) -> Result<String> {
        let tables = match table {
            Some(name) => vec![name.to_string()],
            None => self.list_tables()?,
        };
        let mut description = String::new();
        for name in tables {
            if !self.table_exists(&name)? {
                return Err(PipelineError::UnknownTable { name });
            }
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
            let columns = stmt
                .query_map([], |row| {
                    let column: String = row.get(1)?;
                    let data_type: String = row.get(2)?;
                    Ok(format!("{column} {data_type}"))
                })?
                .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
                [],
                |row| row.get(0),
            )?;
            description.push_str(&format!(
                "{name} ({}): {count} row(s)\n",
                columns.join(", ")
            ));
        }
        Ok(description.trim_end().to_string())
    }

    fn query_read_only(&self, sql: &str) -> Result<QueryResult> {
        let mut stmt = self.conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(PipelineError::MutationRejected(sql.trim().to_string()));
        }
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        let column_count = columns.len();
        let mut rows = stmt.query([])?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut rendered = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let raw: types::Value = row.get(idx)?;
                rendered.push(render_untyped(raw));
            }
            collected.push(rendered);
        }
        Ok(QueryResult {
            columns,
            rows: collected,
        })
    }
}

impl SqliteStore {
    fn duplicate_scan(
        &self,
        table: &TableDefinition,
        by_version: bool,
    ) -> Result<Vec<(String, u64)>> {
        let key_columns = Self::key_select_list(table)?;
        if key_columns.is_empty() {
            return Ok(Vec::new());
        }
        let mut select = key_columns
            .iter()
            .map(|(name, _)| quote_ident(name))
            .join(", ");
        if by_version {
            select.push_str(", source_version");
        }
        let sql = format!(
            "SELECT {select}, COUNT(*) AS n FROM {} GROUP BY {select} HAVING n > 1",
            quote_ident(&table.name)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut duplicates = Vec::new();
        let part_count = key_columns.len() + usize::from(by_version);
        while let Some(row) = rows.next()? {
            let mut parts = Vec::with_capacity(part_count);
            for (idx, (_, domain)) in key_columns.iter().enumerate() {
                let raw: types::Value = row.get(idx)?;
                parts.push(render_stored(*domain, raw));
            }
            if by_version {
                let version: i64 = row.get(key_columns.len())?;
                parts.push(Some(version.to_string()));
            }
            let count: i64 = row.get(part_count)?;
            duplicates.push((join_key(&parts), count as u64));
        }
        Ok(duplicates)
    }
}

fn key_part_to_sql(domain: ValueDomain, part: Option<&str>) -> types::Value {
    match part {
        None => types::Value::Null,
        Some(text) => match domain {
            ValueDomain::Integer => text
                .parse::<i64>()
                .map(types::Value::Integer)
                .unwrap_or_else(|_| types::Value::Text(text.to_string())),
            ValueDomain::Boolean => match text {
                "true" => types::Value::Integer(1),
                "false" => types::Value::Integer(0),
                other => types::Value::Text(other.to_string()),
            },
            _ => types::Value::Text(text.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::UnifiedColumn;

    fn sample_table() -> TableDefinition {
        TableDefinition {
            name: "survey_facts".to_string(),
            columns: vec![
                UnifiedColumn {
                    name: "area".to_string(),
                    domain: ValueDomain::Text,
                    nullable: false,
                    max_length: 16,
                    source_count: 1,
                },
                UnifiedColumn {
                    name: "tot_emp".to_string(),
                    domain: ValueDomain::Integer,
                    nullable: true,
                    max_length: 10,
                    source_count: 1,
                },
            ],
            primary_key: vec!["area".to_string()],
        }
    }

    fn row(hash: &str, source_row: u64, area: &str, tot_emp: Option<i64>) -> MigrationRow {
        MigrationRow {
            source_hash: hash.to_string(),
            source_row,
            source_version: 1,
            values: vec![
                Some(Value::Text(area.to_string())),
                tot_emp.map(Value::Integer),
            ],
        }
    }

    #[test]
    fn insert_chunk_is_transactional_per_call() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let table = sample_table();
        store.ensure_table(&table).unwrap();

        let outcome = store
            .insert_chunk(&table, &[row("h1", 1, "0100000", Some(120))])
            .unwrap();
        assert_eq!(outcome.inserted, 1);

        // A malformed row anywhere in the chunk persists nothing.
        let bad = MigrationRow {
            source_hash: "h1".to_string(),
            source_row: 2,
            source_version: 1,
            values: vec![Some(Value::Text("0200000".to_string()))],
        };
        let result = store.insert_chunk(&table, &[row("h1", 3, "0300000", None), bad]);
        assert!(result.is_err());
        assert_eq!(store.count_source_rows("survey_facts", "h1").unwrap(), 1);
    }

    #[test]
    fn checkpointed_delete_removes_only_rows_above_the_mark() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let table = sample_table();
        store.ensure_table(&table).unwrap();

        store
            .insert_chunk(&table, &[row("old", 1, "0100000", Some(1))])
            .unwrap();
        let mark = store.max_row_id("survey_facts").unwrap();
        store
            .insert_chunk(
                &table,
                &[row("new", 1, "0200000", Some(2)), row("new", 2, "0300000", None)],
            )
            .unwrap();

        let payload = CheckpointPayload {
            version: 1,
            table: "survey_facts".to_string(),
            source_hash: "new".to_string(),
            high_water_row_id: mark,
        };
        let deleted = store.delete_checkpointed_rows(&payload).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_source_rows("survey_facts", "new").unwrap(), 0);
        assert_eq!(store.count_source_rows("survey_facts", "old").unwrap(), 1);
    }

    #[test]
    fn read_only_surface_rejects_mutations() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let table = sample_table();
        store.ensure_table(&table).unwrap();

        assert!(matches!(
            store.query_read_only("DELETE FROM survey_facts"),
            Err(PipelineError::MutationRejected(_))
        ));

        store
            .insert_chunk(&table, &[row("h1", 1, "0100000", Some(5))])
            .unwrap();
        let result = store
            .query_read_only("SELECT area, tot_emp FROM survey_facts")
            .unwrap();
        assert_eq!(result.columns, vec!["area", "tot_emp"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0].as_deref(), Some("0100000"));
    }

    #[test]
    fn duplicate_scan_reports_multiplicity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let table = sample_table();
        store.ensure_table(&table).unwrap();
        store
            .insert_chunk(
                &table,
                &[
                    row("h1", 1, "0100000", Some(1)),
                    row("h1", 2, "0100000", Some(2)),
                    row("h1", 3, "0200000", Some(3)),
                ],
            )
            .unwrap();
        let duplicates = store.duplicate_keys(&table).unwrap();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].1, 2);
    }

    #[test]
    fn checkpoint_ledger_is_append_only_and_returns_the_latest() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let table = sample_table();
        store.ensure_table(&table).unwrap();
        assert!(
            store
                .latest_checkpoint("survey_facts", "h1")
                .unwrap()
                .is_none()
        );

        let first = CheckpointToken::encode("survey_facts", "h1", 0).unwrap();
        store.record_checkpoint(&first, &first.decode().unwrap()).unwrap();
        let second = CheckpointToken::encode("survey_facts", "h1", 7).unwrap();
        store.record_checkpoint(&second, &second.decode().unwrap()).unwrap();

        let latest = store
            .latest_checkpoint("survey_facts", "h1")
            .unwrap()
            .unwrap();
        assert_eq!(latest.decode().unwrap().high_water_row_id, 7);
    }

    #[test]
    fn key_join_distinguishes_null_from_empty() {
        let null_key = join_key(&[Some("a".to_string()), None]);
        let empty_key = join_key(&[Some("a".to_string()), Some(String::new())]);
        assert_ne!(null_key, empty_key);
    }
}
