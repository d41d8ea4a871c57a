//! WorkStore implementation on SQLite.
//!
//! The database file is the single source of truth for status and lease
//! ownership. Every mutation is one conditional statement inside an
//! IMMEDIATE transaction, so several processes can share the file without a
//! read-then-write window. Nothing about leases is cached between calls.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::domain::{IssueSummary, RunOutcome};
use crate::error::{Result, ScryerError};
use crate::store::clock::{Clock, SystemClock};
use crate::store::records::{ItemStatus, WorkItem};

const SCHEMA_VERSION: i64 = 1;

const ITEM_COLUMNS: &str = "id, title, body, url, labels_json, source_updated_at, status, \
     lease_owner, lease_expiry, attempt_count, tool_failures, infra_failures, last_outcome, \
     last_error, branch, pr_url, head_sha, last_run_dir, created_at, updated_at, started_at, \
     completed_at";

/// Expired leases an item may lose before recovery parks it in `needs_attention`.
pub const DEFAULT_MAX_INFRA_RETRIES: u32 = 5;

/// Pending, or running on a lease that is gone with retries left. `?1` is now in millis.
fn claimable(max_infra_retries: u32) -> String {
    format!(
        "(status = 'pending' OR (status = 'running' AND (lease_expiry IS NULL OR lease_expiry <= ?1) \
         AND infra_failures + 1 < {}))",
        max_infra_retries
    )
}

/// WorkStore manages work items and their leases.
pub struct WorkStore {
    /// Path to the SQLite file
    db_path: PathBuf,

    /// Connection owned by this process
    db: Connection,

    clock: Arc<dyn Clock>,

    /// A lost lease counts as an infrastructure failure against this limit
    max_infra_retries: u32,
}

impl std::fmt::Debug for WorkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStore").field("db_path", &self.db_path).finish()
    }
}

impl WorkStore {
    /// Open or create the store at `db_path` using the wall clock.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_clock(db_path, Arc::new(SystemClock))
    }

    /// Open or create the store with an explicit clock.
    pub fn open_with_clock(db_path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if db_path.is_dir() {
            return Err(ScryerError::StoreCorrupt(format!(
                "refusing to use directory as database: {}",
                db_path.display()
            )));
        }

        let db = Connection::open(db_path)?;
        db.busy_timeout(std::time::Duration::from_secs(10))?;

        let corrupt = |e: rusqlite::Error| ScryerError::StoreCorrupt(format!("{}: {}", db_path.display(), e));
        let _mode: String = db
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(corrupt)?;
        let version: i64 = db
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(corrupt)?;

        if version > SCHEMA_VERSION {
            return Err(ScryerError::StoreCorrupt(format!(
                "{} has schema version {}, newest known is {}",
                db_path.display(),
                version,
                SCHEMA_VERSION
            )));
        }
        if version < SCHEMA_VERSION {
            Self::init_schema(&db).map_err(corrupt)?;
        }

        log::debug!("opened store path={} schema_version={}", db_path.display(), SCHEMA_VERSION);

        Ok(Self {
            db_path: db_path.to_path_buf(),
            db,
            clock,
            max_infra_retries: DEFAULT_MAX_INFRA_RETRIES,
        })
    }

    /// Limit on lost leases before an item is parked in `needs_attention`.
    pub fn with_max_infra_retries(mut self, max_infra_retries: u32) -> Self {
        self.max_infra_retries = max_infra_retries.max(1);
        self
    }

    /// Initialize the SQLite schema.
    fn init_schema(db: &Connection) -> rusqlite::Result<()> {
        db.execute_batch(&format!(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS work_items (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                body TEXT,
                url TEXT,
                labels_json TEXT NOT NULL DEFAULT '[]',
                source_updated_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                lease_owner TEXT,
                lease_expiry INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                tool_failures INTEGER NOT NULL DEFAULT 0,
                infra_failures INTEGER NOT NULL DEFAULT 0,
                last_outcome TEXT,
                last_error TEXT,
                branch TEXT,
                pr_url TEXT,
                head_sha TEXT,
                last_run_dir TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
            CREATE INDEX IF NOT EXISTS idx_work_items_lease ON work_items(lease_expiry);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            PRAGMA user_version = {};
            COMMIT;
            "#,
            SCHEMA_VERSION
        ))
    }

    /// Run `f` inside an IMMEDIATE transaction so the write lock is taken up front.
    fn immediate<T>(&self, f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>) -> Result<T> {
        let tx = Transaction::new_unchecked(&self.db, TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Current time on the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Atomically lease one claimable item among `candidate_ids`.
    ///
    /// Claimable means `pending`, or `running` under an expired lease. The
    /// winner gets `status = running`, the caller's token, a fresh expiry and
    /// an incremented attempt count. Taking over an expired lease also counts
    /// an infrastructure failure; an item at the limit is left for
    /// [`WorkStore::reclaim_expired`] to park.
    pub fn claim(&self, candidate_ids: &[u64], owner: &str, lease: Duration) -> Result<Option<WorkItem>> {
        if candidate_ids.is_empty() {
            return Ok(None);
        }
        let now = self.now();
        let expiry = now + lease;
        let sql = format!(
            "UPDATE work_items
             SET status = 'running', lease_owner = ?2, lease_expiry = ?3,
                 attempt_count = attempt_count + 1, started_at = ?1, updated_at = ?1,
                 infra_failures = CASE WHEN status = 'running' THEN infra_failures + 1 ELSE infra_failures END,
                 last_outcome = CASE WHEN status = 'running' THEN 'infrastructure-failed' ELSE last_outcome END,
                 last_error = CASE WHEN status = 'running'
                     THEN 'lease expired (held by ' || COALESCE(lease_owner, 'unknown') || ')'
                     ELSE last_error END
             WHERE id = (
                 SELECT id FROM work_items
                 WHERE id IN ({ids}) AND {claimable}
                 ORDER BY COALESCE(source_updated_at, '') DESC, id ASC
                 LIMIT 1
             )
             AND {claimable}
             RETURNING {columns}",
            ids = id_list(candidate_ids),
            claimable = claimable(self.max_infra_retries),
            columns = ITEM_COLUMNS,
        );

        self.immediate(|tx| {
            tx.query_row(
                &sql,
                params![now.timestamp_millis(), owner, expiry.timestamp_millis()],
                row_to_item,
            )
            .optional()
        })
    }

    /// Renew the lease only while `owner` still holds it.
    pub fn extend(&self, id: u64, owner: &str, lease: Duration) -> Result<bool> {
        let now = self.now();
        let expiry = now + lease;
        let changed = self.immediate(|tx| {
            tx.execute(
                "UPDATE work_items SET lease_expiry = ?1, updated_at = ?2
                 WHERE id = ?3 AND lease_owner = ?4 AND status = 'running'",
                params![expiry.timestamp_millis(), now.timestamp_millis(), id as i64, owner],
            )
        })?;
        Ok(changed == 1)
    }

    /// Record `outcome` with `final_status` and drop the lease.
    ///
    /// No-op returning false when `owner` no longer holds the lease; the run
    /// that reclaimed the item owns its outcome now.
    pub fn release(&self, id: u64, owner: &str, outcome: &RunOutcome, final_status: ItemStatus) -> Result<bool> {
        let now = self.now().timestamp_millis();
        let kind = outcome.kind().as_str();
        let changed = self.immediate(|tx| {
            tx.execute(
                "UPDATE work_items
                 SET status = ?1, lease_owner = NULL, lease_expiry = NULL,
                     last_outcome = ?2, last_error = ?3,
                     tool_failures = CASE WHEN ?2 = 'tool-failed' THEN tool_failures + 1 ELSE 0 END,
                     infra_failures = CASE WHEN ?2 = 'infrastructure-failed' THEN infra_failures + 1 ELSE 0 END,
                     head_sha = COALESCE(?4, head_sha),
                     completed_at = CASE WHEN ?5 THEN ?6 ELSE completed_at END,
                     updated_at = ?6
                 WHERE id = ?7 AND lease_owner = ?8 AND status = 'running'",
                params![
                    final_status.as_str(),
                    kind,
                    outcome.error(),
                    outcome.head_sha(),
                    final_status.is_terminal(),
                    now,
                    id as i64,
                    owner,
                ],
            )
        })?;
        Ok(changed == 1)
    }

    /// Release as `skipped` without a processing attempt.
    pub fn skip(&self, id: u64, owner: &str, reason: &str) -> Result<bool> {
        let now = self.now().timestamp_millis();
        let changed = self.immediate(|tx| {
            tx.execute(
                "UPDATE work_items
                 SET status = 'skipped', lease_owner = NULL, lease_expiry = NULL,
                     last_error = ?1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND lease_owner = ?4 AND status = 'running'",
                params![reason, now, id as i64, owner],
            )
        })?;
        Ok(changed == 1)
    }

    /// Drop every expired lease and return the affected items.
    ///
    /// Each lost lease counts as an infrastructure failure. Items still under
    /// the limit go back to `pending`; the rest move to `needs_attention`.
    pub fn reclaim_expired(&self) -> Result<Vec<WorkItem>> {
        let now = self.now().timestamp_millis();
        let sql = format!(
            "UPDATE work_items
             SET status = CASE WHEN infra_failures + 1 >= ?2 THEN 'needs_attention' ELSE 'pending' END,
                 lease_owner = NULL, lease_expiry = NULL,
                 infra_failures = infra_failures + 1,
                 last_outcome = 'infrastructure-failed',
                 last_error = 'lease expired (held by ' || COALESCE(lease_owner, 'unknown') || ')',
                 completed_at = CASE WHEN infra_failures + 1 >= ?2 THEN ?1 ELSE completed_at END,
                 updated_at = ?1
             WHERE status = 'running' AND (lease_expiry IS NULL OR lease_expiry <= ?1)
             RETURNING {}",
            ITEM_COLUMNS
        );
        let limit = self.max_infra_retries as i64;
        self.immediate(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![now, limit], row_to_item)?;
            rows.collect()
        })
    }

    /// Number of items per status.
    pub fn counts_by_status(&self) -> Result<BTreeMap<ItemStatus, usize>> {
        let mut stmt = self
            .db
            .prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            let status = status
                .parse::<ItemStatus>()
                .map_err(ScryerError::StoreCorrupt)?;
            counts.insert(status, count as usize);
        }
        Ok(counts)
    }

    /// Insert newly listed issues as `pending`; refresh metadata of known ones.
    ///
    /// Status and lease columns of existing rows are never touched here.
    pub fn upsert_issues(&self, issues: &[IssueSummary]) -> Result<usize> {
        let now = self.now().timestamp_millis();
        self.immediate(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO work_items (id, title, url, labels_json, source_updated_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     title = excluded.title,
                     url = COALESCE(excluded.url, work_items.url),
                     labels_json = excluded.labels_json,
                     source_updated_at = excluded.source_updated_at,
                     updated_at = excluded.updated_at",
            )?;
            for issue in issues {
                let labels = serde_json::to_string(&issue.labels).unwrap_or_else(|_| "[]".to_string());
                stmt.execute(params![
                    issue.number as i64,
                    issue.title,
                    issue.url,
                    labels,
                    issue.updated_at,
                    now,
                ])?;
            }
            Ok(issues.len())
        })
    }

    /// Store the body of a freshly read issue.
    pub fn record_body(&self, id: u64, body: Option<&str>) -> Result<()> {
        let now = self.now().timestamp_millis();
        self.immediate(|tx| {
            tx.execute(
                "UPDATE work_items SET body = ?1, updated_at = ?2 WHERE id = ?3",
                params![body, now, id as i64],
            )
        })?;
        Ok(())
    }

    /// Ids among `candidate_ids` that a claim could take right now.
    pub fn claimable_among(&self, candidate_ids: &[u64]) -> Result<Vec<u64>> {
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id FROM work_items WHERE id IN ({}) AND {} \
             ORDER BY COALESCE(source_updated_at, '') DESC, id ASC",
            id_list(candidate_ids),
            claimable(self.max_infra_retries)
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params![self.now().timestamp_millis()], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row? as u64);
        }
        Ok(ids)
    }

    /// Ids currently under a live lease, by any owner.
    pub fn active_lease_ids(&self) -> Result<HashSet<u64>> {
        let mut stmt = self.db.prepare(
            "SELECT id FROM work_items
             WHERE status = 'running' AND lease_owner IS NOT NULL AND lease_expiry > ?1",
        )?;
        let rows = stmt.query_map(params![self.now().timestamp_millis()], |row| row.get::<_, i64>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row? as u64);
        }
        Ok(ids)
    }

    /// Number of live leases, by any owner.
    pub fn live_lease_count(&self) -> Result<usize> {
        Ok(self.active_lease_ids()?.len())
    }

    /// Attach branch and PR url while `owner` holds the lease.
    pub fn record_publication(&self, id: u64, owner: &str, branch: &str, pr_url: &str) -> Result<bool> {
        let now = self.now().timestamp_millis();
        let changed = self.immediate(|tx| {
            tx.execute(
                "UPDATE work_items SET branch = ?1, pr_url = ?2, updated_at = ?3
                 WHERE id = ?4 AND lease_owner = ?5 AND status = 'running'",
                params![branch, pr_url, now, id as i64, owner],
            )
        })?;
        Ok(changed == 1)
    }

    /// Attach the run artifact directory while `owner` holds the lease.
    pub fn record_run_dir(&self, id: u64, owner: &str, run_dir: &Path) -> Result<bool> {
        let changed = self.immediate(|tx| {
            tx.execute(
                "UPDATE work_items SET last_run_dir = ?1
                 WHERE id = ?2 AND lease_owner = ?3 AND status = 'running'",
                params![run_dir.display().to_string(), id as i64, owner],
            )
        })?;
        Ok(changed == 1)
    }

    /// Get a work item by id.
    pub fn get(&self, id: u64) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {} FROM work_items WHERE id = ?1", ITEM_COLUMNS);
        Ok(self.db.query_row(&sql, params![id as i64], row_to_item).optional()?)
    }

    /// List all work items by id.
    pub fn list(&self) -> Result<Vec<WorkItem>> {
        let sql = format!("SELECT {} FROM work_items ORDER BY id", ITEM_COLUMNS);
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Items that reached `done` on `date` (`YYYY-MM-DD`).
    pub fn daily_done_count(&self, date: &str) -> Result<u32> {
        let value: Option<String> = self
            .db
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![daily_key(date)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn increment_daily_done(&self, date: &str) -> Result<u32> {
        self.immediate(|tx| {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, '1')
                 ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
                params![daily_key(date)],
            )
        })?;
        self.daily_done_count(date)
    }

    /// Delete every item and meta entry. Returns (items, meta) removed.
    pub fn clear(&self) -> Result<(usize, usize)> {
        self.immediate(|tx| {
            let items = tx.execute("DELETE FROM work_items", [])?;
            let meta = tx.execute("DELETE FROM meta", [])?;
            Ok((items, meta))
        })
    }
}

fn daily_key(date: &str) -> String {
    format!("done_count:{}", date)
}

/// Render ids as an SQL list. Integers only, so nothing to escape.
fn id_list(ids: &[u64]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn ms_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let labels_json: String = row.get("labels_json")?;
    let status: String = row.get("status")?;
    let last_outcome: Option<String> = row.get("last_outcome")?;

    Ok(WorkItem {
        id: row.get::<_, i64>("id")? as u64,
        title: row.get("title")?,
        body: row.get("body")?,
        url: row.get("url")?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        source_updated_at: row.get("source_updated_at")?,
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        lease_owner: row.get("lease_owner")?,
        lease_expiry: row.get::<_, Option<i64>>("lease_expiry")?.map(ms_to_time),
        attempt_count: row.get("attempt_count")?,
        tool_failures: row.get("tool_failures")?,
        infra_failures: row.get("infra_failures")?,
        last_outcome: last_outcome
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| conversion_error(12, e))?,
        last_error: row.get("last_error")?,
        branch: row.get("branch")?,
        pr_url: row.get("pr_url")?,
        head_sha: row.get("head_sha")?,
        last_run_dir: row.get("last_run_dir")?,
        created_at: ms_to_time(row.get("created_at")?),
        updated_at: ms_to_time(row.get("updated_at")?),
        started_at: row.get::<_, Option<i64>>("started_at")?.map(ms_to_time),
        completed_at: row.get::<_, Option<i64>>("completed_at")?.map(ms_to_time),
    })
}
