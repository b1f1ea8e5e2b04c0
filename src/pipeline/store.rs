//! Snapshot Store
//!
//! SQLite persistence for run metadata, staged rows, versioned partition
//! snapshots and revision records.
//!
//! # Schema Design
//!
//! ```sql
//! CREATE TABLE runs (
//!     run_id TEXT PRIMARY KEY,
//!     started_at INTEGER NOT NULL,
//!     finished_at INTEGER,
//!     config_fingerprint TEXT NOT NULL,
//!     window_start TEXT NOT NULL,
//!     window_end TEXT NOT NULL,
//!     output_mode TEXT NOT NULL,
//!     status TEXT NOT NULL,          -- running | succeeded | succeeded_with_warnings | failed
//!     resumed_from TEXT,
//!     report_json TEXT
//! );
//!
//! -- One row per published version of a (pool, date) partition.
//! CREATE TABLE snapshots (
//!     snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     pool_key TEXT NOT NULL,
//!     partition_date TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     status TEXT NOT NULL,          -- provisional | frozen
//!     supersedes INTEGER,
//!     content_hash TEXT NOT NULL,
//!     row_count INTEGER NOT NULL,
//!     run_id TEXT NOT NULL,
//!     created_at INTEGER NOT NULL,
//!     UNIQUE (pool_key, partition_date, version)
//! );
//!
//! CREATE TABLE feature_rows (snapshot_id, minute_ts, row_hash, row_json);
//! CREATE TABLE staged_rows (run_id, pool_key, partition_date, minute_ts, row_hash, row_json);
//! CREATE TABLE revision_records (...);
//! CREATE TABLE partition_progress (run_id, pool_key, partition_date, snapshot_id, completed_at);
//! ```
//!
//! # Guarantees
//!
//! - Rows are staged first and become visible only through [`SnapshotStore::publish_staged`],
//!   a single transaction. Readers see the previous version or the new one.
//! - Snapshot rows are never updated or deleted. A new version is a new row set.
//! - A partition whose latest version is frozen rejects every provisional write.

use crate::pipeline::clock::Nanos;
use crate::pipeline::config::OutputMode;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::features::FeatureRow;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema version for migrations.
const SCHEMA_VERSION: u32 = 1;

const DATE_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// RECORD TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::SucceededWithWarnings => "succeeded_with_warnings",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "succeeded_with_warnings" => Some(Self::SucceededWithWarnings),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One row per pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: Nanos,
    pub finished_at: Option<Nanos>,
    pub config_fingerprint: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub output_mode: OutputMode,
    pub status: RunStatus,
    /// Failed run whose published partitions this run skipped.
    pub resumed_from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Provisional,
    Frozen,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisional => "provisional",
            Self::Frozen => "frozen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisional" => Some(Self::Provisional),
            "frozen" => Some(Self::Frozen),
            _ => None,
        }
    }
}

impl From<OutputMode> for SnapshotStatus {
    fn from(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Provisional => Self::Provisional,
            OutputMode::Frozen => Self::Frozen,
        }
    }
}

/// A published, immutable version of one (pool, date) partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: i64,
    pub pool_key: String,
    pub partition_date: NaiveDate,
    pub version: u32,
    pub status: SnapshotStatus,
    pub supersedes: Option<i64>,
    pub content_hash: String,
    pub row_count: u64,
    pub run_id: String,
    pub created_at: Nanos,
}

/// A provisional row whose value changed on a later run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub run_id: String,
    pub pool_key: String,
    pub partition_date: NaiveDate,
    pub minute_ts: Nanos,
    pub old_snapshot_id: i64,
    /// Filled in when the new version is published.
    pub new_snapshot_id: Option<i64>,
    pub old_row_hash: String,
    pub new_row_hash: String,
    pub changed_fields: Vec<String>,
    pub revised_at: Nanos,
}

/// A feature row together with its content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row: FeatureRow,
    pub row_hash: String,
}

/// What [`SnapshotStore::publish_staged`] writes.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub run_id: &'a str,
    pub pool_key: &'a str,
    pub date: NaiveDate,
    pub status: SnapshotStatus,
    pub content_hash: &'a str,
    pub revisions: &'a [RevisionRecord],
    pub created_at: Nanos,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub runs: u64,
    pub snapshots: u64,
    pub frozen_partitions: u64,
    pub provisional_partitions: u64,
    pub revisions: u64,
    pub staged_rows: u64,
}

fn date_str(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn conversion_error(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {}: {}", what, value).into(),
    )
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotInfo> {
    let date: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(SnapshotInfo {
        snapshot_id: row.get(0)?,
        pool_key: row.get(1)?,
        partition_date: parse_date(&date)?,
        version: row.get(3)?,
        status: SnapshotStatus::parse(&status).ok_or_else(|| conversion_error("snapshot status", &status))?,
        supersedes: row.get(5)?,
        content_hash: row.get(6)?,
        row_count: row.get::<_, i64>(7)? as u64,
        run_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const SNAPSHOT_COLUMNS: &str = "snapshot_id, pool_key, partition_date, version, status, supersedes, \
     content_hash, row_count, run_id, created_at";

// =============================================================================
// STORE
// =============================================================================

/// SQLite-backed snapshot store, shared across partition workers.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> PipelineResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        conn.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)", [])?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current_version {
            None => {
                Self::create_schema_v1(&conn)?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("Created snapshot store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Snapshot store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!("Snapshot store schema version mismatch: expected {}, got {}", SCHEMA_VERSION, v);
            }
        }
        Ok(())
    }

    fn create_schema_v1(conn: &Connection) -> PipelineResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                config_fingerprint TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                output_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                resumed_from TEXT,
                report_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_fingerprint
                ON runs(config_fingerprint, window_start, window_end, started_at DESC);

            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
                pool_key TEXT NOT NULL,
                partition_date TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                supersedes INTEGER REFERENCES snapshots(snapshot_id),
                content_hash TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (pool_key, partition_date, version)
            );

            CREATE TABLE IF NOT EXISTS feature_rows (
                snapshot_id INTEGER NOT NULL REFERENCES snapshots(snapshot_id),
                minute_ts INTEGER NOT NULL,
                row_hash TEXT NOT NULL,
                row_json TEXT NOT NULL,
                PRIMARY KEY (snapshot_id, minute_ts)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS staged_rows (
                run_id TEXT NOT NULL,
                pool_key TEXT NOT NULL,
                partition_date TEXT NOT NULL,
                minute_ts INTEGER NOT NULL,
                row_hash TEXT NOT NULL,
                row_json TEXT NOT NULL,
                PRIMARY KEY (run_id, pool_key, partition_date, minute_ts)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS revision_records (
                revision_id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                pool_key TEXT NOT NULL,
                partition_date TEXT NOT NULL,
                minute_ts INTEGER NOT NULL,
                old_snapshot_id INTEGER NOT NULL,
                new_snapshot_id INTEGER NOT NULL,
                old_row_hash TEXT NOT NULL,
                new_row_hash TEXT NOT NULL,
                changed_fields TEXT NOT NULL,
                revised_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_revisions_partition
                ON revision_records(pool_key, partition_date, minute_ts);

            CREATE TABLE IF NOT EXISTS partition_progress (
                run_id TEXT NOT NULL,
                pool_key TEXT NOT NULL,
                partition_date TEXT NOT NULL,
                snapshot_id INTEGER,
                completed_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, pool_key, partition_date)
            ) WITHOUT ROWID;
        "#,
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    pub fn begin_run(&self, meta: &RunMetadata) -> PipelineResult<()> {
        if meta.status != RunStatus::Running {
            return Err(PipelineError::InvalidTransition(format!(
                "run {} must start as running",
                meta.run_id
            )));
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO runs (
                run_id, started_at, finished_at, config_fingerprint, window_start, window_end,
                output_mode, status, resumed_from, report_json
            ) VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, NULL)"#,
            params![
                meta.run_id,
                meta.started_at,
                meta.config_fingerprint,
                date_str(meta.window_start),
                date_str(meta.window_end),
                SnapshotStatus::from(meta.output_mode).as_str(),
                meta.status.as_str(),
                meta.resumed_from,
            ],
        )?;
        debug!(run_id = %meta.run_id, "run started");
        Ok(())
    }

    /// The only permitted mutation of a run: `running` to a terminal status.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: Nanos,
        report_json: Option<&str>,
    ) -> PipelineResult<()> {
        if !status.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "run {} cannot finish as running",
                run_id
            )));
        }
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE runs SET status = ?, finished_at = ?, report_json = ? WHERE run_id = ? AND status = 'running'",
            params![status.as_str(), finished_at, report_json, run_id],
        )?;
        if updated == 0 {
            return Err(PipelineError::InvalidTransition(format!(
                "run {} is not running",
                run_id
            )));
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> PipelineResult<Option<RunMetadata>> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                r#"SELECT run_id, started_at, finished_at, config_fingerprint, window_start,
                          window_end, output_mode, status, resumed_from
                   FROM runs WHERE run_id = ?"#,
                [run_id],
                Self::run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn run_report_json(&self, run_id: &str) -> PipelineResult<Option<String>> {
        let conn = self.conn.lock();
        let json: Option<Option<String>> = conn
            .query_row("SELECT report_json FROM runs WHERE run_id = ?", [run_id], |r| r.get(0))
            .optional()?;
        Ok(json.flatten())
    }

    fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunMetadata> {
        let start: String = row.get(4)?;
        let end: String = row.get(5)?;
        let mode: String = row.get(6)?;
        let status: String = row.get(7)?;
        let output_mode = match SnapshotStatus::parse(&mode) {
            Some(SnapshotStatus::Frozen) => OutputMode::Frozen,
            Some(SnapshotStatus::Provisional) => OutputMode::Provisional,
            None => return Err(conversion_error("output mode", &mode)),
        };
        Ok(RunMetadata {
            run_id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            config_fingerprint: row.get(3)?,
            window_start: parse_date(&start)?,
            window_end: parse_date(&end)?,
            output_mode,
            status: RunStatus::parse(&status).ok_or_else(|| conversion_error("run status", &status))?,
            resumed_from: row.get(8)?,
        })
    }

    /// Most recent failed run with the same fingerprint and window.
    pub fn find_resumable_run(
        &self,
        config_fingerprint: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> PipelineResult<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                r#"SELECT run_id FROM runs
                   WHERE config_fingerprint = ? AND window_start = ? AND window_end = ? AND status = 'failed'
                   ORDER BY started_at DESC LIMIT 1"#,
                params![config_fingerprint, date_str(window_start), date_str(window_end)],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Staging and publication
    // -------------------------------------------------------------------------

    /// Replace the staged rows of one partition for a run.
    pub fn stage_rows(&self, run_id: &str, pool_key: &str, date: NaiveDate, rows: &[StoredRow]) -> PipelineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let d = date_str(date);
        tx.execute(
            "DELETE FROM staged_rows WHERE run_id = ? AND pool_key = ? AND partition_date = ?",
            params![run_id, pool_key, d],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO staged_rows (run_id, pool_key, partition_date, minute_ts, row_hash, row_json) VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for r in rows {
                let json = serde_json::to_string(&r.row)?;
                stmt.execute(params![run_id, pool_key, d, r.row.minute_ts, r.row_hash, json])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn staged_row_count(&self, run_id: &str) -> PipelineResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM staged_rows WHERE run_id = ?", [run_id], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Drop every staged row of a run.
    pub fn discard_staging(&self, run_id: &str) -> PipelineResult<u64> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM staged_rows WHERE run_id = ?", [run_id])?;
        Ok(n as u64)
    }

    /// Atomically turn the staged rows of a partition into a new snapshot version.
    ///
    /// In one transaction: checks the partition is not frozen (unless publishing
    /// a frozen correction), inserts the snapshot, moves the staged rows, writes
    /// the revision records and marks the partition complete for the run.
    pub fn publish_staged(&self, req: &PublishRequest<'_>) -> PipelineResult<SnapshotInfo> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let d = date_str(req.date);

        let latest = Self::latest_in(&tx, req.pool_key, req.date)?;
        if let Some(cur) = &latest {
            if cur.status == SnapshotStatus::Frozen && req.status == SnapshotStatus::Provisional {
                return Err(PipelineError::RevisionConflict {
                    pool: req.pool_key.to_string(),
                    date: req.date,
                    reason: format!("version {} is frozen", cur.version),
                });
            }
        }

        let row_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM staged_rows WHERE run_id = ? AND pool_key = ? AND partition_date = ?",
            params![req.run_id, req.pool_key, d],
            |r| r.get(0),
        )?;
        if row_count == 0 {
            return Err(PipelineError::NotFound(format!(
                "staged rows for {}/{} in run {}",
                req.pool_key, req.date, req.run_id
            )));
        }

        let version = latest.as_ref().map_or(1, |s| s.version + 1);
        let supersedes = latest.as_ref().map(|s| s.snapshot_id);
        tx.execute(
            r#"INSERT INTO snapshots (pool_key, partition_date, version, status, supersedes,
                                      content_hash, row_count, run_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                req.pool_key,
                d,
                version,
                req.status.as_str(),
                supersedes,
                req.content_hash,
                row_count,
                req.run_id,
                req.created_at
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();

        tx.execute(
            r#"INSERT INTO feature_rows (snapshot_id, minute_ts, row_hash, row_json)
               SELECT ?, minute_ts, row_hash, row_json FROM staged_rows
               WHERE run_id = ? AND pool_key = ? AND partition_date = ?"#,
            params![snapshot_id, req.run_id, req.pool_key, d],
        )?;
        tx.execute(
            "DELETE FROM staged_rows WHERE run_id = ? AND pool_key = ? AND partition_date = ?",
            params![req.run_id, req.pool_key, d],
        )?;
        Self::insert_revisions(&tx, req.revisions, snapshot_id)?;
        Self::mark_complete_in(&tx, req.run_id, req.pool_key, req.date, Some(snapshot_id), req.created_at)?;

        let info = Self::snapshot_in(&tx, snapshot_id)?;
        tx.commit()?;

        info!(
            pool = %req.pool_key,
            date = %req.date,
            version,
            status = req.status.as_str(),
            rows = row_count,
            revisions = req.revisions.len(),
            "partition published"
        );
        Ok(info)
    }

    fn insert_revisions(tx: &Transaction<'_>, revisions: &[RevisionRecord], new_snapshot_id: i64) -> PipelineResult<()> {
        let mut stmt = tx.prepare(
            r#"INSERT INTO revision_records (run_id, pool_key, partition_date, minute_ts, old_snapshot_id,
                   new_snapshot_id, old_row_hash, new_row_hash, changed_fields, revised_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )?;
        for rev in revisions {
            stmt.execute(params![
                rev.run_id,
                rev.pool_key,
                date_str(rev.partition_date),
                rev.minute_ts,
                rev.old_snapshot_id,
                new_snapshot_id,
                rev.old_row_hash,
                rev.new_row_hash,
                serde_json::to_string(&rev.changed_fields)?,
                rev.revised_at,
            ])?;
        }
        Ok(())
    }

    /// Record that a partition needed no new version in this run.
    pub fn mark_complete(
        &self,
        run_id: &str,
        pool_key: &str,
        date: NaiveDate,
        snapshot_id: Option<i64>,
        completed_at: Nanos,
    ) -> PipelineResult<()> {
        let conn = self.conn.lock();
        Self::mark_complete_in(&conn, run_id, pool_key, date, snapshot_id, completed_at)
    }

    fn mark_complete_in(
        conn: &Connection,
        run_id: &str,
        pool_key: &str,
        date: NaiveDate,
        snapshot_id: Option<i64>,
        completed_at: Nanos,
    ) -> PipelineResult<()> {
        conn.execute(
            r#"INSERT OR REPLACE INTO partition_progress (run_id, pool_key, partition_date, snapshot_id, completed_at)
               VALUES (?, ?, ?, ?, ?)"#,
            params![run_id, pool_key, date_str(date), snapshot_id, completed_at],
        )?;
        Ok(())
    }

    /// Partitions a run finished (published or confirmed unchanged).
    pub fn completed_partitions(&self, run_id: &str) -> PipelineResult<HashSet<(String, NaiveDate)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT pool_key, partition_date FROM partition_progress WHERE run_id = ?")?;
        let rows = stmt.query_map([run_id], |r| {
            let d: String = r.get(1)?;
            Ok((r.get::<_, String>(0)?, parse_date(&d)?))
        })?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Freeze
    // -------------------------------------------------------------------------

    /// Publish the latest provisional version of a partition as a new frozen version.
    ///
    /// The frozen version carries the same rows and content hash.
    pub fn freeze(&self, pool_key: &str, date: NaiveDate, run_id: &str, created_at: Nanos) -> PipelineResult<SnapshotInfo> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let cur = Self::latest_in(&tx, pool_key, date)?
            .ok_or_else(|| PipelineError::NotFound(format!("partition {}/{}", pool_key, date)))?;
        if cur.status == SnapshotStatus::Frozen {
            return Err(PipelineError::RevisionConflict {
                pool: pool_key.to_string(),
                date,
                reason: format!("already frozen at version {}", cur.version),
            });
        }

        tx.execute(
            r#"INSERT INTO snapshots (pool_key, partition_date, version, status, supersedes,
                                      content_hash, row_count, run_id, created_at)
               VALUES (?, ?, ?, 'frozen', ?, ?, ?, ?, ?)"#,
            params![
                pool_key,
                date_str(date),
                cur.version + 1,
                cur.snapshot_id,
                cur.content_hash,
                cur.row_count as i64,
                run_id,
                created_at
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();
        tx.execute(
            r#"INSERT INTO feature_rows (snapshot_id, minute_ts, row_hash, row_json)
               SELECT ?, minute_ts, row_hash, row_json FROM feature_rows WHERE snapshot_id = ?"#,
            params![snapshot_id, cur.snapshot_id],
        )?;
        let info = Self::snapshot_in(&tx, snapshot_id)?;
        tx.commit()?;

        info!(pool = %pool_key, date = %date, version = info.version, "partition frozen");
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn latest_in(conn: &Connection, pool_key: &str, date: NaiveDate) -> PipelineResult<Option<SnapshotInfo>> {
        let sql = format!(
            "SELECT {} FROM snapshots WHERE pool_key = ? AND partition_date = ? ORDER BY version DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        let info = conn
            .query_row(&sql, params![pool_key, date_str(date)], snapshot_from_row)
            .optional()?;
        Ok(info)
    }

    fn snapshot_in(conn: &Connection, snapshot_id: i64) -> PipelineResult<SnapshotInfo> {
        let sql = format!("SELECT {} FROM snapshots WHERE snapshot_id = ?", SNAPSHOT_COLUMNS);
        Ok(conn.query_row(&sql, [snapshot_id], snapshot_from_row)?)
    }

    /// Current (highest) version of a partition.
    pub fn latest_snapshot(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<Option<SnapshotInfo>> {
        let conn = self.conn.lock();
        Self::latest_in(&conn, pool_key, date)
    }

    pub fn snapshot(&self, snapshot_id: i64) -> PipelineResult<SnapshotInfo> {
        let conn = self.conn.lock();
        Self::snapshot_in(&conn, snapshot_id).map_err(|e| match e {
            PipelineError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => {
                PipelineError::NotFound(format!("snapshot {}", snapshot_id))
            }
            other => other,
        })
    }

    /// Every version of a partition, oldest first.
    pub fn snapshot_versions(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<Vec<SnapshotInfo>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM snapshots WHERE pool_key = ? AND partition_date = ? ORDER BY version ASC",
            SNAPSHOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pool_key, date_str(date)], snapshot_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Current version of every partition, ordered by pool then date.
    pub fn current_partitions(&self) -> PipelineResult<Vec<SnapshotInfo>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"SELECT {} FROM snapshots s
               WHERE version = (SELECT MAX(version) FROM snapshots
                                WHERE pool_key = s.pool_key AND partition_date = s.partition_date)
               ORDER BY pool_key, partition_date"#,
            SNAPSHOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], snapshot_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Rows of one snapshot in minute order.
    pub fn snapshot_rows(&self, snapshot_id: i64) -> PipelineResult<Vec<StoredRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT row_hash, row_json FROM feature_rows WHERE snapshot_id = ? ORDER BY minute_ts ASC",
        )?;
        let raw = stmt.query_map([snapshot_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for item in raw {
            let (row_hash, json) = item?;
            out.push(StoredRow { row: serde_json::from_str(&json)?, row_hash });
        }
        Ok(out)
    }

    /// Rows of the current version of a partition, if any.
    pub fn current_rows(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<Option<(SnapshotInfo, Vec<StoredRow>)>> {
        match self.latest_snapshot(pool_key, date)? {
            Some(info) => {
                let rows = self.snapshot_rows(info.snapshot_id)?;
                Ok(Some((info, rows)))
            }
            None => Ok(None),
        }
    }

    /// Current rows of `pool_key` for the dates in `[first, last]`, oldest first.
    /// Dates without a snapshot are skipped.
    pub fn history_rows(&self, pool_key: &str, first: NaiveDate, last: NaiveDate) -> PipelineResult<Vec<FeatureRow>> {
        let mut out = Vec::new();
        for date in crate::pipeline::clock::date_range(first, last) {
            if let Some((_, rows)) = self.current_rows(pool_key, date)? {
                out.extend(rows.into_iter().map(|r| r.row));
            }
        }
        Ok(out)
    }

    pub fn revisions(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<Vec<RevisionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT run_id, pool_key, partition_date, minute_ts, old_snapshot_id, new_snapshot_id,
                      old_row_hash, new_row_hash, changed_fields, revised_at
               FROM revision_records WHERE pool_key = ? AND partition_date = ?
               ORDER BY minute_ts ASC, revision_id ASC"#,
        )?;
        let raw = stmt.query_map(params![pool_key, date_str(date)], |r| {
            let d: String = r.get(2)?;
            let fields: String = r.get(8)?;
            Ok((
                RevisionRecord {
                    run_id: r.get(0)?,
                    pool_key: r.get(1)?,
                    partition_date: parse_date(&d)?,
                    minute_ts: r.get(3)?,
                    old_snapshot_id: r.get(4)?,
                    new_snapshot_id: r.get(5)?,
                    old_row_hash: r.get(6)?,
                    new_row_hash: r.get(7)?,
                    changed_fields: Vec::new(),
                    revised_at: r.get(9)?,
                },
                fields,
            ))
        })?;
        let mut out = Vec::new();
        for item in raw {
            let (mut rec, fields) = item?;
            rec.changed_fields = serde_json::from_str(&fields)?;
            out.push(rec);
        }
        Ok(out)
    }

    pub fn revision_count_for_run(&self, run_id: &str) -> PipelineResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM revision_records WHERE run_id = ?", [run_id], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Number of partitions per current status.
    pub fn stats(&self) -> PipelineResult<StoreStats> {
        let mut stats = StoreStats::default();
        let mut by_status: BTreeMap<SnapshotStatus, u64> = BTreeMap::new();
        for p in self.current_partitions()? {
            *by_status.entry(p.status).or_insert(0) += 1;
        }
        stats.frozen_partitions = by_status.get(&SnapshotStatus::Frozen).copied().unwrap_or(0);
        stats.provisional_partitions = by_status.get(&SnapshotStatus::Provisional).copied().unwrap_or(0);

        let conn = self.conn.lock();
        let count = |sql: &str| -> PipelineResult<u64> {
            let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
            Ok(n as u64)
        };
        stats.runs = count("SELECT COUNT(*) FROM runs")?;
        stats.snapshots = count("SELECT COUNT(*) FROM snapshots")?;
        stats.revisions = count("SELECT COUNT(*) FROM revision_records")?;
        stats.staged_rows = count("SELECT COUNT(*) FROM staged_rows")?;
        Ok(stats)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::{day_start, NANOS_PER_MIN};
    use crate::pipeline::config::{CostBandConfig, PoolConfig};
    use crate::pipeline::features::{FeatureConstructor, MinuteInputs, PoolFeatureState};
    use crate::pipeline::fingerprint::row_hash;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn rows(n: usize, gas: f64) -> Vec<StoredRow> {
        let cost = CostBandConfig::default();
        let pool = PoolConfig { pool_key: "p".into(), fee_tier_bps: 5.0, cex_symbol: "X".into() };
        let fc = FeatureConstructor::new(&cost, &pool);
        let mut state = PoolFeatureState::new(30, 30);
        (0..n)
            .map(|i| {
                let mut row = fc.build_row(&mut state, day_start(date()) + i as i64 * NANOS_PER_MIN, MinuteInputs::default());
                row.gas_usd = Some(gas);
                let row_hash = row_hash(&row).unwrap();
                StoredRow { row, row_hash }
            })
            .collect()
    }

    fn meta(run_id: &str) -> RunMetadata {
        RunMetadata {
            run_id: run_id.into(),
            started_at: 1,
            finished_at: None,
            config_fingerprint: "fp".into(),
            window_start: date(),
            window_end: date(),
            output_mode: OutputMode::Provisional,
            status: RunStatus::Running,
            resumed_from: None,
        }
    }

    fn publish(store: &SnapshotStore, run_id: &str, status: SnapshotStatus, staged: &[StoredRow]) -> PipelineResult<SnapshotInfo> {
        store.stage_rows(run_id, "p", date(), staged)?;
        store.publish_staged(&PublishRequest {
            run_id,
            pool_key: "p",
            date: date(),
            status,
            content_hash: "h",
            revisions: &[],
            created_at: 2,
        })
    }

    #[test]
    fn test_run_status_transitions() {
        let store = SnapshotStore::in_memory().unwrap();
        store.begin_run(&meta("r1")).unwrap();
        store.finish_run("r1", RunStatus::Succeeded, 5, Some("{}")).unwrap();
        let run = store.get_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.finished_at, Some(5));
        assert_eq!(store.run_report_json("r1").unwrap().as_deref(), Some("{}"));

        let err = store.finish_run("r1", RunStatus::Failed, 6, None).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition(_)));
    }

    #[test]
    fn test_staged_rows_invisible_until_published() {
        let store = SnapshotStore::in_memory().unwrap();
        store.stage_rows("r1", "p", date(), &rows(3, 1.0)).unwrap();
        assert!(store.latest_snapshot("p", date()).unwrap().is_none());
        assert_eq!(store.staged_row_count("r1").unwrap(), 3);

        let snap = store
            .publish_staged(&PublishRequest {
                run_id: "r1",
                pool_key: "p",
                date: date(),
                status: SnapshotStatus::Provisional,
                content_hash: "h",
                revisions: &[],
                created_at: 2,
            })
            .unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.row_count, 3);
        assert_eq!(store.staged_row_count("r1").unwrap(), 0);
        assert_eq!(store.snapshot_rows(snap.snapshot_id).unwrap(), rows(3, 1.0));
        assert!(store.completed_partitions("r1").unwrap().contains(&("p".to_string(), date())));
    }

    #[test]
    fn test_discard_staging() {
        let store = SnapshotStore::in_memory().unwrap();
        store.stage_rows("r1", "p", date(), &rows(2, 1.0)).unwrap();
        assert_eq!(store.discard_staging("r1").unwrap(), 2);
        assert!(publish(&store, "r2", SnapshotStatus::Provisional, &[]).is_err());
    }

    #[test]
    fn test_freeze_blocks_provisional_writes() {
        let store = SnapshotStore::in_memory().unwrap();
        let v1 = publish(&store, "r1", SnapshotStatus::Provisional, &rows(3, 1.0)).unwrap();
        let frozen = store.freeze("p", date(), "r1", 3).unwrap();
        assert_eq!(frozen.version, 2);
        assert_eq!(frozen.supersedes, Some(v1.snapshot_id));
        assert_eq!(frozen.status, SnapshotStatus::Frozen);

        let err = publish(&store, "r2", SnapshotStatus::Provisional, &rows(3, 9.0)).unwrap_err();
        assert!(matches!(err, PipelineError::RevisionConflict { .. }));
        let (cur, kept) = store.current_rows("p", date()).unwrap().unwrap();
        assert_eq!(cur.snapshot_id, frozen.snapshot_id);
        assert_eq!(kept, rows(3, 1.0));

        assert!(matches!(
            store.freeze("p", date(), "r3", 4).unwrap_err(),
            PipelineError::RevisionConflict { .. }
        ));
    }

    #[test]
    fn test_frozen_correction_is_new_version() {
        let store = SnapshotStore::in_memory().unwrap();
        publish(&store, "r1", SnapshotStatus::Provisional, &rows(2, 1.0)).unwrap();
        let frozen = store.freeze("p", date(), "r1", 3).unwrap();
        let corrected = publish(&store, "fix", SnapshotStatus::Frozen, &rows(2, 2.0)).unwrap();
        assert_eq!(corrected.version, 3);
        assert_eq!(corrected.supersedes, Some(frozen.snapshot_id));
        assert_eq!(store.snapshot_rows(frozen.snapshot_id).unwrap(), rows(2, 1.0));
        assert_eq!(store.snapshot_versions("p", date()).unwrap().len(), 3);
    }

    #[test]
    fn test_resumable_run_lookup() {
        let store = SnapshotStore::in_memory().unwrap();
        store.begin_run(&meta("r1")).unwrap();
        store.finish_run("r1", RunStatus::Failed, 2, None).unwrap();
        assert_eq!(store.find_resumable_run("fp", date(), date()).unwrap().as_deref(), Some("r1"));
        assert!(store.find_resumable_run("other", date(), date()).unwrap().is_none());
    }

    #[test]
    fn test_on_disk_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        {
            let store = SnapshotStore::new(&path).unwrap();
            publish(&store, "r1", SnapshotStatus::Provisional, &rows(2, 1.0)).unwrap();
        }
        let store = SnapshotStore::new(&path).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.snapshots, 1);
        assert_eq!(stats.provisional_partitions, 1);
    }
}
