//! SQLite-backed store for repos, commits, review jobs, reviews and
//! comments.
//!
//! A single connection behind a mutex serializes all writes; public
//! operations are async and run the rusqlite work on the blocking pool.
//! Multi-statement operations (claim, complete, enqueue-by-ref) execute
//! inside a single transaction so concurrent workers can never observe a
//! half-applied transition.
//!
//! # Schema Versioning
//!
//! A `schema_version` table tracks the installed schema. Schema changes
//! increment `CURRENT_SCHEMA_VERSION` and add a migration in
//! `run_migrations()`; migrations run sequentially from the installed
//! version to the target.

mod commits;
mod jobs;
mod repos;
mod reviews;


use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use roborev_core::config::ReasoningLevel;

pub use jobs::{EnqueueOpts, EnqueueTarget};

/// Current schema version. Increment when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StorageError {
    pub(crate) fn storage(operation: &str, detail: impl fmt::Display) -> Self {
        StorageError::Storage(format!("{operation}: {detail}"))
    }
}

/// `map_err` adapter carrying the operation name into the error.
pub(crate) fn sql(operation: &'static str) -> impl Fn(rusqlite::Error) -> StorageError {
    move |e| StorageError::storage(operation, e)
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    pub id: i64,
    pub root_path: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: i64,
    pub repo_id: i64,
    pub sha: String,
    pub author: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("invalid job status {other:?}")),
        }
    }
}

/// A review job joined with its repo and commit metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub repo_id: i64,
    pub commit_id: i64,
    pub agent: String,
    pub model: Option<String>,
    pub reasoning: Option<ReasoningLevel>,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub repo_path: String,
    pub repo_name: String,
    pub commit_sha: String,
    pub commit_subject: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: i64,
    pub job_id: i64,
    pub agent: String,
    pub prompt: String,
    pub output: String,
    pub addressed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i64,
    pub job_id: i64,
    pub responder: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

// =============================================================================
// Timestamp helpers — RFC 3339 text columns, always UTC
// =============================================================================

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_ts(operation: &str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::storage(operation, format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_ts_opt(
    operation: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(|s| parse_ts(operation, &s)).transpose()
}

// =============================================================================
// Storage handle
// =============================================================================

/// Handle to the review store. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the store at `path` and run pending migrations.
    ///
    /// The database is configured with `journal_mode = WAL` (verified —
    /// some filesystems silently keep DELETE mode, which would break the
    /// durability assumptions) and a 5 s busy timeout.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;

                    // The directory is the primary guard: SQLite creates
                    // WAL/SHM sidecars with default umask permissions.
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let mode = std::fs::Permissions::from_mode(0o700);
                        if let Err(e) = std::fs::set_permissions(parent, mode) {
                            warn!(error = %e, "failed to restrict data directory permissions");
                        }
                    }
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StorageError::storage("open database", e))?;

        // The store holds full diffs and review text.
        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, mode) {
                warn!(error = %e, "failed to restrict database file permissions");
            }
        }

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(sql("set journal_mode"))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StorageError::storage(
                "configure journal_mode",
                format!("SQLite returned {journal_mode:?} instead of 'wal'"),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(sql("configure pragmas"))?;

        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            for suffix in ["-wal", "-shm"] {
                let sidecar = format!("{path_str}{suffix}");
                if Path::new(&sidecar).exists() {
                    let mode = std::fs::Permissions::from_mode(0o600);
                    if let Err(e) = std::fs::set_permissions(&sidecar, mode) {
                        warn!(error = %e, path = %sidecar, "failed to restrict sidecar file permissions");
                    }
                }
            }
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sql("create schema_version table"))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql("get schema version"))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StorageError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::storage(
                "schema version",
                format!(
                    "database schema version {from_version} is newer than supported \
                     version {CURRENT_SCHEMA_VERSION}; upgrade the daemon"
                ),
            ));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    root_path TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id),
                    sha TEXT NOT NULL UNIQUE,
                    author TEXT NOT NULL DEFAULT '',
                    subject TEXT NOT NULL DEFAULT '',
                    timestamp TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS review_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id),
                    commit_id INTEGER NOT NULL REFERENCES commits(id),
                    agent TEXT NOT NULL,
                    model TEXT,
                    reasoning TEXT,
                    status TEXT NOT NULL DEFAULT 'queued',
                    enqueued_at TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT,
                    worker_id TEXT,
                    error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status_enqueued
                    ON review_jobs(status, enqueued_at);

                CREATE TABLE IF NOT EXISTS reviews (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL UNIQUE REFERENCES review_jobs(id),
                    agent TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    output TEXT NOT NULL,
                    addressed INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES review_jobs(id),
                    responder TEXT NOT NULL,
                    response TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_comments_job
                    ON comments(job_id);
                "#,
            )
            .map_err(sql("migration v1"))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            [CURRENT_SCHEMA_VERSION],
        )
        .map_err(sql("update schema version"))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::storage("blocking task", e))?
    }
}
