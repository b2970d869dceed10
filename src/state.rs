// src/state.rs
//! Watermark store: durable run history and per-item processed marks.
//!
//! Backed by SQLite. Every public operation is one transaction, so a crash at
//! any point leaves either the old state or the new one. The `runs` and
//! `processed_items` tables double as the operator-facing surface.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::ItemKey;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error text written to runs found `running` when the store is opened.
pub const ABANDONED_REASON: &str = "abandoned: process exited before the run finished";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id          TEXT PRIMARY KEY,
    subscription_id TEXT NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('running','completed','failed','aborted')),
    started_at      TEXT NOT NULL,
    finished_at     TEXT,
    period_start    TEXT NOT NULL,
    period_end      TEXT NOT NULL,
    items_fetched   INTEGER NOT NULL DEFAULT 0,
    items_processed INTEGER NOT NULL DEFAULT 0,
    degraded        INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    retry_from      TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_subscription ON runs(subscription_id, period_end);
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_running
    ON runs(subscription_id) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS processed_items (
    subscription_id TEXT NOT NULL,
    channel_id      TEXT NOT NULL,
    item_id         TEXT NOT NULL,
    processed_at    TEXT NOT NULL,
    run_id          TEXT NOT NULL REFERENCES runs(run_id),
    PRIMARY KEY (subscription_id, channel_id, item_id)
);
CREATE INDEX IF NOT EXISTS idx_processed_run ON processed_items(run_id);

CREATE TABLE IF NOT EXISTS skipped_fires (
    subscription_id TEXT NOT NULL,
    fire_at         TEXT NOT NULL,
    noted_at        TEXT NOT NULL,
    PRIMARY KEY (subscription_id, fire_at)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `runs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub subscription_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub items_fetched: u64,
    pub items_processed: u64,
    pub degraded: bool,
    pub error_message: Option<String>,
    /// Oldest item this run left unmarked, if any.
    pub retry_from: Option<DateTime<Utc>>,
}

/// Counters and notes written alongside a successful commit.
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub items_fetched: usize,
    pub degraded: bool,
    /// Non-fatal problems (sink failures, dropped clusters) kept for operators.
    pub error_detail: Option<String>,
    /// Timestamp of the oldest fetched item left unmarked. The next window
    /// reaches back to it.
    pub retry_from: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct WatermarkStore {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for WatermarkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkStore").finish_non_exhaustive()
    }
}

impl WatermarkStore {
    /// Open (or create) the state database and recover abandoned runs.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self::connect(path.as_ref())?;
        store.recover()?;
        Ok(store)
    }

    /// Open without touching `running` rows, for inspecting the history of
    /// a database a live daemon may be using.
    pub fn open_for_inspection(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::connect(path.as_ref())
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self::init(Connection::open_in_memory()?)?;
        store.recover()?;
        Ok(store)
    }

    fn connect(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        info!(path = %path.display(), "state database opened");
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn recover(&self) -> StoreResult<()> {
        let recovered = self.abort_all_running(ABANDONED_REASON)?;
        if recovered > 0 {
            warn!(recovered, "marked abandoned runs as aborted");
        }
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Open a run for `subscription_id`. Fails with `ConcurrentRun` when one is
    /// already `running`.
    pub fn begin_run(
        &self,
        subscription_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<String> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT run_id FROM runs WHERE subscription_id = ?1 AND status = 'running' LIMIT 1",
                params![subscription_id],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(run_id) = existing {
            return Err(StoreError::ConcurrentRun {
                subscription_id: subscription_id.to_string(),
                run_id,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO runs (run_id, subscription_id, status, started_at, period_start, period_end)
             VALUES (?1, ?2, 'running', ?3, ?4, ?5)",
            params![
                run_id,
                subscription_id,
                ts(Utc::now()),
                ts(period_start),
                ts(period_end)
            ],
        )?;
        tx.commit()?;
        debug!(%run_id, subscription_id, "run opened");
        Ok(run_id)
    }

    /// Write every mark in `keys` and flip the run to `completed`, atomically.
    /// A mark that already exists rolls the whole commit back.
    pub fn commit_run(
        &self,
        run_id: &str,
        keys: &BTreeSet<ItemKey>,
        summary: &CommitSummary,
    ) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (subscription_id, status) = run_state(&tx, run_id)?;
        if status.is_terminal() {
            return Err(StoreError::AlreadyTerminal {
                run_id: run_id.to_string(),
                status,
            });
        }

        let now = ts(Utc::now());
        {
            let mut insert = tx.prepare(
                "INSERT INTO processed_items (subscription_id, channel_id, item_id, processed_at, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for key in keys {
                match insert.execute(params![
                    subscription_id,
                    key.channel_id,
                    key.item_id,
                    now,
                    run_id
                ]) {
                    Ok(_) => {}
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        return Err(StoreError::DuplicateMark {
                            subscription_id,
                            channel_id: key.channel_id.clone(),
                            item_id: key.item_id.clone(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        tx.execute(
            "UPDATE runs
             SET status = 'completed', finished_at = ?2, items_fetched = ?3,
                 items_processed = ?4, degraded = ?5, error_message = ?6, retry_from = ?7
             WHERE run_id = ?1",
            params![
                run_id,
                now,
                summary.items_fetched as i64,
                keys.len() as i64,
                summary.degraded,
                summary.error_detail,
                summary.retry_from.map(ts)
            ],
        )?;
        tx.commit()?;
        info!(run_id, subscription_id = %subscription_id, marks = keys.len(), "run committed");
        Ok(keys.len())
    }

    /// Close a run as `failed` without writing any marks. Returns `false` if
    /// the run had already reached a terminal status.
    pub fn abort_run(&self, run_id: &str, error: &str) -> StoreResult<bool> {
        self.finish_without_marks(run_id, RunStatus::Failed, error)
    }

    /// Close a run as `aborted` (shutdown or cancellation).
    pub fn cancel_run(&self, run_id: &str, reason: &str) -> StoreResult<bool> {
        self.finish_without_marks(run_id, RunStatus::Aborted, reason)
    }

    fn finish_without_marks(
        &self,
        run_id: &str,
        status: RunStatus,
        error: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE runs SET status = ?2, finished_at = ?3, error_message = ?4
             WHERE run_id = ?1 AND status = 'running'",
            params![run_id, status.as_str(), ts(Utc::now()), error],
        )?;
        if updated == 0 {
            // Distinguish "already terminal" from "never existed".
            run_state(&tx, run_id)?;
            return Ok(false);
        }
        tx.commit()?;
        info!(run_id, status = %status, error, "run closed without commit");
        Ok(true)
    }

    /// Abort every run still `running`. Used at open and after the shutdown
    /// grace period.
    pub fn abort_all_running(&self, reason: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE runs SET status = 'aborted', finished_at = ?1, error_message = ?2
             WHERE status = 'running'",
            params![ts(Utc::now()), reason],
        )?;
        Ok(n)
    }

    /// `period_end` of the latest completed run.
    pub fn watermark_of(&self, subscription_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(period_end) FROM runs WHERE subscription_id = ?1 AND status = 'completed'",
            params![subscription_id],
            |r| r.get(0),
        )?;
        raw.as_deref().map(parse_ts).transpose()
    }

    /// `retry_from` of the latest completed run: where the next window must
    /// reach back to so items left unmarked are fetched again.
    pub fn retry_floor_of(&self, subscription_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT retry_from FROM runs
                 WHERE subscription_id = ?1 AND status = 'completed'
                 ORDER BY period_end DESC, rowid DESC LIMIT 1",
                params![subscription_id],
                |r| r.get(0),
            )
            .optional()?;
        raw.flatten().as_deref().map(parse_ts).transpose()
    }

    /// `period_end` of the latest run in any status: the last fire the
    /// scheduler acted on.
    pub fn last_fire_of(&self, subscription_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(period_end) FROM runs WHERE subscription_id = ?1",
            params![subscription_id],
            |r| r.get(0),
        )?;
        raw.as_deref().map(parse_ts).transpose()
    }

    pub fn is_processed(&self, subscription_id: &str, key: &ItemKey) -> StoreResult<bool> {
        let conn = self.lock()?;
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_items
                 WHERE subscription_id = ?1 AND channel_id = ?2 AND item_id = ?3",
                params![subscription_id, key.channel_id, key.item_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Keys from `candidates` that already carry a processed mark.
    pub fn processed_among<'a, I>(
        &self,
        subscription_id: &str,
        candidates: I,
    ) -> StoreResult<BTreeSet<ItemKey>>
    where
        I: IntoIterator<Item = &'a ItemKey>,
    {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM processed_items
             WHERE subscription_id = ?1 AND channel_id = ?2 AND item_id = ?3",
        )?;
        let mut out = BTreeSet::new();
        for key in candidates {
            if stmt.exists(params![subscription_id, key.channel_id, key.item_id])? {
                out.insert(key.clone());
            }
        }
        Ok(out)
    }

    pub fn processed_count(&self, subscription_id: &str) -> StoreResult<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_items WHERE subscription_id = ?1",
            params![subscription_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Record fires the scheduler skipped. Idempotent per instant.
    pub fn note_skipped_fires(
        &self,
        subscription_id: &str,
        fires: &[DateTime<Utc>],
    ) -> StoreResult<usize> {
        if fires.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO skipped_fires (subscription_id, fire_at, noted_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for fire in fires {
                inserted += stmt.execute(params![subscription_id, ts(*fire), now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn skipped_fires(&self, subscription_id: &str) -> StoreResult<Vec<DateTime<Utc>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT fire_at FROM skipped_fires WHERE subscription_id = ?1 ORDER BY fire_at",
        )?;
        let rows = stmt.query_map(params![subscription_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(parse_ts(&raw?)?);
        }
        Ok(out)
    }

    pub fn run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                RawRun::from_row,
            )
            .optional()?;
        row.map(RawRun::into_record).transpose()
    }

    /// Latest runs for a subscription, newest first.
    pub fn recent_runs(&self, subscription_id: &str, limit: usize) -> StoreResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE subscription_id = ?1
             ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![subscription_id, limit as i64], RawRun::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_record()?);
        }
        Ok(out)
    }
}

const RUN_COLUMNS: &str = "run_id, subscription_id, status, started_at, finished_at, \
     period_start, period_end, items_fetched, items_processed, degraded, error_message, retry_from";

struct RawRun {
    run_id: String,
    subscription_id: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    period_start: String,
    period_end: String,
    items_fetched: i64,
    items_processed: i64,
    degraded: bool,
    error_message: Option<String>,
    retry_from: Option<String>,
}

impl RawRun {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: r.get(0)?,
            subscription_id: r.get(1)?,
            status: r.get(2)?,
            started_at: r.get(3)?,
            finished_at: r.get(4)?,
            period_start: r.get(5)?,
            period_end: r.get(6)?,
            items_fetched: r.get(7)?,
            items_processed: r.get(8)?,
            degraded: r.get(9)?,
            error_message: r.get(10)?,
            retry_from: r.get(11)?,
        })
    }

    fn into_record(self) -> StoreResult<RunRecord> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("run status {:?}", self.status)))?;
        Ok(RunRecord {
            run_id: self.run_id,
            subscription_id: self.subscription_id,
            status,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            period_start: parse_ts(&self.period_start)?,
            period_end: parse_ts(&self.period_end)?,
            items_fetched: self.items_fetched.max(0) as u64,
            items_processed: self.items_processed.max(0) as u64,
            degraded: self.degraded,
            error_message: self.error_message,
            retry_from: self.retry_from.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Bring a database created by an older build up to the current schema.
fn migrate(conn: &Connection) -> StoreResult<()> {
    let columns = {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('runs')")?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };
    if !columns.iter().any(|c| c == "retry_from") {
        conn.execute_batch("ALTER TABLE runs ADD COLUMN retry_from TEXT")?;
        info!("state schema migrated: runs.retry_from");
    }
    Ok(())
}

fn run_state(conn: &Connection, run_id: &str) -> StoreResult<(String, RunStatus)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT subscription_id, status FROM runs WHERE run_id = ?1",
            params![run_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (subscription_id, raw) = row.ok_or_else(|| StoreError::UnknownRun(run_id.to_string()))?;
    let status = RunStatus::parse(&raw)
        .ok_or_else(|| StoreError::Corrupt(format!("run status {raw:?}")))?;
    Ok((subscription_id, status))
}

/// Fixed-width UTC text so lexical order matches chronological order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}
