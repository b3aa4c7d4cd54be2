//! Commit rows. SHAs are globally unique, so lookups ignore the repo.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{now_rfc3339, parse_ts, sql, Commit, Storage, StorageError};

type CommitRow = (i64, i64, String, String, String, String, String);

fn commit_from_row(operation: &str, row: CommitRow) -> Result<Commit, StorageError> {
    let (id, repo_id, sha, author, subject, timestamp, created_at) = row;
    Ok(Commit {
        id,
        repo_id,
        sha,
        author,
        subject,
        timestamp: parse_ts(operation, &timestamp)?,
        created_at: parse_ts(operation, &created_at)?,
    })
}

fn lookup_by_sha(
    conn: &Connection,
    operation: &'static str,
    sha: &str,
) -> Result<Option<Commit>, StorageError> {
    conn.query_row(
        "SELECT id, repo_id, sha, author, subject, timestamp, created_at
         FROM commits WHERE sha = ?1",
        params![sha],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        },
    )
    .optional()
    .map_err(sql(operation))?
    .map(|r| commit_from_row(operation, r))
    .transpose()
}

pub(super) fn insert_commit(
    conn: &Connection,
    repo_id: i64,
    sha: &str,
    author: &str,
    subject: &str,
    timestamp: &str,
) -> Result<i64, StorageError> {
    conn.execute(
        "INSERT INTO commits (repo_id, sha, author, subject, timestamp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![repo_id, sha, author, subject, timestamp, now_rfc3339()],
    )
    .map_err(sql("create commit"))?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn commit_id_by_sha(
    conn: &Connection,
    sha: &str,
) -> Result<Option<i64>, StorageError> {
    conn.query_row(
        "SELECT id FROM commits WHERE sha = ?1",
        params![sha],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql("lookup commit"))
}

impl Storage {
    /// Find or create a commit record, idempotent on `sha`.
    pub async fn get_or_create_commit(
        &self,
        repo_id: i64,
        sha: &str,
        author: &str,
        subject: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Commit, StorageError> {
        let sha = sha.to_string();
        let author = author.to_string();
        let subject = subject.to_string();
        self.blocking(move |conn| {
            if let Some(commit) = lookup_by_sha(conn, "get commit", &sha)? {
                return Ok(commit);
            }

            let ts = timestamp.to_rfc3339();
            let id = insert_commit(conn, repo_id, &sha, &author, &subject, &ts)?;
            Ok(Commit {
                id,
                repo_id,
                sha,
                author,
                subject,
                timestamp,
                created_at: Utc::now(),
            })
        })
        .await
    }

    /// Look up a commit by its SHA.
    pub async fn get_commit_by_sha(&self, sha: &str) -> Result<Commit, StorageError> {
        let sha = sha.to_string();
        self.blocking(move |conn| {
            lookup_by_sha(conn, "get commit", &sha)?.ok_or(StorageError::NotFound)
        })
        .await
    }
}
