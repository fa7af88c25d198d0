//! SQLite-backed relational store for the usage-reports dashboard.
//!
//! The store owns a small pool of worker threads, each holding its own
//! connection to the same database file, fed through a bounded channel.
//! Callers submit closures and await the result over a oneshot channel,
//! so the async service never blocks on SQLite directly. A full queue
//! surfaces as [`StoreError::PoolExhausted`]; nothing is retried here.

use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use usage_reports_core::{JiraIssueRecord, LogRecord, QueryPlan, Row, SqlParam};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS user_info (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL,
  role TEXT,
  ip_address TEXT NOT NULL,
  queue_name TEXT NOT NULL,
  rows_returned INTEGER NOT NULL CHECK (rows_returned >= 0),
  date_inserted TEXT NOT NULL,
  date_reset TEXT,
  outcome TEXT NOT NULL,
  tool_year INTEGER NOT NULL,
  tool_id INTEGER NOT NULL DEFAULT 1,
  permalink TEXT
);

CREATE TABLE IF NOT EXISTS jira_issues (
  issue_id INTEGER NOT NULL,
  issue_key TEXT PRIMARY KEY,
  requestor_email TEXT NOT NULL,
  status TEXT,
  resolution TEXT,
  labels TEXT,
  ai_result TEXT,
  created TEXT,
  updated TEXT,
  resolved TEXT,
  summary TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_user_info_email ON user_info(email);
CREATE INDEX IF NOT EXISTS idx_user_info_date_inserted ON user_info(date_inserted);
CREATE INDEX IF NOT EXISTS idx_user_info_date_reset ON user_info(date_reset);
CREATE INDEX IF NOT EXISTS idx_user_info_year_outcome ON user_info(tool_year, outcome);
CREATE INDEX IF NOT EXISTS idx_jira_issues_requestor ON jira_issues(requestor_email);
CREATE INDEX IF NOT EXISTS idx_jira_issues_created ON jira_issues(created);
";

const INSERT_LOG_RECORD_SQL: &str = "
INSERT INTO user_info
  (email, role, ip_address, queue_name, rows_returned, date_inserted,
   date_reset, outcome, tool_year, tool_id, permalink)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const UPSERT_JIRA_ISSUE_SQL: &str = "
INSERT INTO jira_issues
  (issue_id, issue_key, requestor_email, status, resolution, labels,
   ai_result, created, updated, resolved, summary)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(issue_key) DO UPDATE SET
  issue_id = excluded.issue_id,
  requestor_email = excluded.requestor_email,
  status = excluded.status,
  resolution = excluded.resolution,
  labels = excluded.labels,
  ai_result = excluded.ai_result,
  updated = excluded.updated,
  resolved = excluded.resolved,
  summary = excluded.summary";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool queue is full")]
    PoolExhausted,
    #[error("store workers are no longer running")]
    WorkerGone,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Sizing for the worker pool and its submission queue.
///
/// A submission beyond `queue_limit` pending jobs fails immediately with
/// [`StoreError::PoolExhausted`] instead of waiting.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4, queue_limit: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
}

type Job = Box<dyn FnOnce(&Connection) + Send + 'static>;

pub struct UsageStore {
    sender: SyncSender<Job>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl UsageStore {
    /// Open the store with default pool sizing, applying pending schema
    /// migrations first.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, PoolConfig::default())
    }

    /// Open the store with explicit pool sizing.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open_with(path: &Path, config: PoolConfig) -> Result<Self> {
        let bootstrap = open_connection(path)?;
        migrate(&bootstrap)?;
        drop(bootstrap);

        let (sender, receiver) = mpsc::sync_channel::<Job>(config.queue_limit.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let worker_count = config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let conn = open_connection(path)?;
            let receiver = Arc::clone(&receiver);
            workers.push(thread::spawn(move || worker_loop(&conn, &receiver)));
        }

        Ok(Self { sender, _workers: workers })
    }

    /// Submit a closure to the pool and await its result.
    ///
    /// # Errors
    /// Fails with [`StoreError::PoolExhausted`] when the submission queue
    /// is full, [`StoreError::WorkerGone`] when the pool has shut down,
    /// or the underlying SQLite error from the closure itself.
    pub async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = tx.send(op(conn));
        });

        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => StoreError::PoolExhausted,
            TrySendError::Disconnected(_) => StoreError::WorkerGone,
        })?;

        rx.await
            .map_err(|_| StoreError::WorkerGone)?
            .map_err(StoreError::from)
    }

    /// Execute a parameterized plan and return its rows keyed by column
    /// alias.
    ///
    /// # Errors
    /// Returns an error when the pool is exhausted or the query fails.
    pub async fn select(&self, plan: &QueryPlan) -> Result<Vec<Row>, StoreError> {
        let sql = plan.sql.clone();
        let params = bind_values(&plan.params);
        self.run(move |conn| select_rows(conn, &sql, &params)).await
    }

    /// # Errors
    /// Returns an error when the pool is exhausted or the insert fails.
    pub async fn insert_log_record(&self, record: LogRecord) -> Result<(), StoreError> {
        self.insert_log_records(vec![record]).await.map(|_| ())
    }

    /// Insert a batch of usage log records in one transaction.
    ///
    /// # Errors
    /// Returns an error when the pool is exhausted or any insert fails.
    pub async fn insert_log_records(&self, records: Vec<LogRecord>) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare(INSERT_LOG_RECORD_SQL)?;
                for record in &records {
                    stmt.execute(params![
                        record.email,
                        record.role,
                        record.ip_address,
                        record.queue_name,
                        record.rows_returned,
                        record.date_inserted,
                        record.date_reset,
                        record.outcome,
                        record.tool_year,
                        record.tool_id,
                        record.permalink,
                    ])?;
                    count += 1;
                }
            }
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    /// Upsert a batch of synced issues, keyed by issue_key. Replaying the
    /// same batch leaves the table unchanged.
    ///
    /// # Errors
    /// Returns an error when the pool is exhausted or the upsert fails.
    pub async fn upsert_jira_issues(
        &self,
        issues: Vec<JiraIssueRecord>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.run(move |conn| {
            let before: i64 =
                conn.query_row("SELECT COUNT(*) FROM jira_issues", [], |row| row.get(0))?;

            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(UPSERT_JIRA_ISSUE_SQL)?;
                for issue in &issues {
                    stmt.execute(params![
                        issue.issue_id,
                        issue.issue_key,
                        issue.requestor_email,
                        issue.status,
                        issue.resolution,
                        issue.labels,
                        issue.ai_result,
                        issue.created,
                        issue.updated,
                        issue.resolved,
                        issue.summary,
                    ])?;
                }
            }
            tx.commit()?;

            let after: i64 =
                conn.query_row("SELECT COUNT(*) FROM jira_issues", [], |row| row.get(0))?;
            let inserted = usize::try_from(after - before).unwrap_or(0);
            Ok(UpsertOutcome {
                total: issues.len(),
                inserted,
                updated: issues.len().saturating_sub(inserted),
            })
        })
        .await
    }

    /// Column structure of the log table, for the diagnostic endpoint.
    ///
    /// # Errors
    /// Returns an error when the pool is exhausted or the pragma fails.
    pub async fn log_table_structure(&self) -> Result<Vec<ColumnInfo>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("PRAGMA table_info(user_info)")?;
            let rows = stmt.query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    column_type: row.get(2)?,
                    not_null: row.get::<_, i64>(3)? != 0,
                    primary_key: row.get::<_, i64>(5)? != 0,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// # Errors
    /// Returns an error when the pool is exhausted or the query fails.
    pub async fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.run(|conn| {
            let current_version: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )?;
            Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION })
        })
        .await
    }
}

fn worker_loop(conn: &Connection, receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        match job {
            Ok(job) => job(conn),
            Err(_) => break,
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .context("failed to read schema version")?;

    if current < 1 {
        conn.execute_batch(MIGRATION_001_SQL)
            .context("failed to apply migration 1")?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![1_i64],
        )
        .context("failed to record migration 1")?;
    }

    Ok(())
}

fn bind_values(params: &[SqlParam]) -> Vec<Value> {
    params
        .iter()
        .map(|param| match param {
            SqlParam::Text(text) => Value::Text(text.clone()),
            SqlParam::Int(int) => Value::Integer(*int),
        })
        .collect()
}

fn select_rows(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| (*name).to_string())
        .collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (index, name) in column_names.iter().enumerate() {
            map.insert(name.clone(), value_to_json(row.get_ref(index)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(int) => serde_json::Value::from(int),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Text(text) => serde_json::Value::from(String::from_utf8_lossy(text).into_owned()),
        // No blob columns exist in this schema.
        ValueRef::Blob(_) => serde_json::Value::Null,
    }
}
