//! Repo rows: one per repository root path, created on first enqueue.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::{now_rfc3339, parse_ts, sql, Repo, Storage, StorageError};

fn repo_from_row(
    operation: &str,
    row: (i64, String, String, String),
) -> Result<Repo, StorageError> {
    let (id, root_path, name, created_at) = row;
    Ok(Repo {
        id,
        root_path,
        name,
        created_at: parse_ts(operation, &created_at)?,
    })
}

fn lookup(conn: &Connection, operation: &'static str, path: &str) -> Result<Option<Repo>, StorageError> {
    conn.query_row(
        "SELECT id, root_path, name, created_at FROM repos WHERE root_path = ?1",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )
    .optional()
    .map_err(sql(operation))?
    .map(|r| repo_from_row(operation, r))
    .transpose()
}

impl Storage {
    /// Find or create a repo keyed on its normalized absolute path.
    /// Idempotent: calling twice with the same path yields the same row.
    pub async fn get_or_create_repo(&self, root_path: &str) -> Result<Repo, StorageError> {
        let root_path = root_path.to_string();
        self.blocking(move |conn| {
            let abs = std::path::absolute(Path::new(&root_path))
                .map_err(|e| StorageError::storage("normalize repo path", e))?;
            let abs = abs.to_string_lossy().into_owned();

            if let Some(repo) = lookup(conn, "get repo", &abs)? {
                return Ok(repo);
            }

            let name = Path::new(&abs)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| abs.clone());
            let created_at = now_rfc3339();
            conn.execute(
                "INSERT INTO repos (root_path, name, created_at) VALUES (?1, ?2, ?3)",
                params![abs, name, created_at],
            )
            .map_err(sql("create repo"))?;

            repo_from_row(
                "create repo",
                (conn.last_insert_rowid(), abs, name, created_at),
            )
        })
        .await
    }

    /// Look up a repo by path without creating it.
    pub async fn get_repo_by_path(&self, root_path: &str) -> Result<Repo, StorageError> {
        let root_path = root_path.to_string();
        self.blocking(move |conn| {
            let abs = std::path::absolute(Path::new(&root_path))
                .map_err(|e| StorageError::storage("normalize repo path", e))?;
            lookup(conn, "get repo", &abs.to_string_lossy())?.ok_or(StorageError::NotFound)
        })
        .await
    }
}
