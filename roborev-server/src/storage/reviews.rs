//! Review and comment rows.
//!
//! A review exists iff its job completed; it never changes afterwards
//! except for the `addressed` flag. Comments are append-only and may
//! reference any existing job regardless of status.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_rfc3339, parse_ts, sql, Comment, Review, Storage, StorageError};

struct RawReview {
    id: i64,
    job_id: i64,
    agent: String,
    prompt: String,
    output: String,
    addressed: bool,
    created_at: String,
}

fn raw_review(row: &Row<'_>) -> rusqlite::Result<RawReview> {
    Ok(RawReview {
        id: row.get(0)?,
        job_id: row.get(1)?,
        agent: row.get(2)?,
        prompt: row.get(3)?,
        output: row.get(4)?,
        addressed: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn finish_review(operation: &str, raw: RawReview) -> Result<Review, StorageError> {
    Ok(Review {
        id: raw.id,
        job_id: raw.job_id,
        agent: raw.agent,
        prompt: raw.prompt,
        output: raw.output,
        addressed: raw.addressed,
        created_at: parse_ts(operation, &raw.created_at)?,
    })
}

const REVIEW_COLUMNS: &str =
    "v.id, v.job_id, v.agent, v.prompt, v.output, v.addressed, v.created_at";

fn job_exists(conn: &Connection, id: i64) -> Result<bool, StorageError> {
    conn.query_row(
        "SELECT 1 FROM review_jobs WHERE id = ?1",
        params![id],
        |_| Ok(()),
    )
    .optional()
    .map_err(sql("check job"))
    .map(|row| row.is_some())
}

impl Storage {
    /// Review for a completed job, if any.
    pub async fn get_review_by_job_id(&self, job_id: i64) -> Result<Review, StorageError> {
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {REVIEW_COLUMNS} FROM reviews v WHERE v.job_id = ?1"),
                params![job_id],
                raw_review,
            )
            .optional()
            .map_err(sql("get review"))?
            .map(|raw| finish_review("get review", raw))
            .transpose()?
            .ok_or(StorageError::NotFound)
        })
        .await
    }

    /// Most recent review of a commit, looked up by SHA.
    pub async fn get_review_by_commit_sha(&self, sha: &str) -> Result<Review, StorageError> {
        let sha = sha.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM reviews v
                     JOIN review_jobs j ON j.id = v.job_id
                     JOIN commits c ON c.id = j.commit_id
                     WHERE c.sha = ?1
                     ORDER BY v.id DESC LIMIT 1"
                ),
                params![sha],
                raw_review,
            )
            .optional()
            .map_err(sql("get review"))?
            .map(|raw| finish_review("get review", raw))
            .transpose()?
            .ok_or(StorageError::NotFound)
        })
        .await
    }

    /// Newest reviews in a repo, for prompt context.
    pub async fn get_recent_reviews(
        &self,
        repo_id: i64,
        limit: usize,
    ) -> Result<Vec<Review>, StorageError> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {REVIEW_COLUMNS} FROM reviews v
                     JOIN review_jobs j ON j.id = v.job_id
                     WHERE j.repo_id = ?1
                     ORDER BY v.id DESC LIMIT ?2"
                ))
                .map_err(sql("recent reviews"))?;
            let rows = stmt
                .query_map(params![repo_id, limit as i64], raw_review)
                .map_err(sql("recent reviews"))?;

            let mut reviews = Vec::new();
            for row in rows {
                reviews.push(finish_review(
                    "recent reviews",
                    row.map_err(sql("recent reviews"))?,
                )?);
            }
            Ok(reviews)
        })
        .await
    }

    /// Flip the `addressed` marker on a review.
    pub async fn set_review_addressed(
        &self,
        review_id: i64,
        addressed: bool,
    ) -> Result<(), StorageError> {
        self.blocking(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE reviews SET addressed = ?1 WHERE id = ?2",
                    params![addressed as i64, review_id],
                )
                .map_err(sql("address review"))?;
            if updated == 0 {
                return Err(StorageError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Attach a comment to a job. The only rejection is a missing job;
    /// the job's status (and whether a review exists) is irrelevant.
    pub async fn add_comment(
        &self,
        job_id: i64,
        responder: &str,
        text: &str,
    ) -> Result<Comment, StorageError> {
        let responder = responder.to_string();
        let text = text.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql("add comment"))?;
            if !job_exists(&tx, job_id)? {
                return Err(StorageError::NotFound);
            }

            let created_at = now_rfc3339();
            tx.execute(
                "INSERT INTO comments (job_id, responder, response, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_id, responder, text, created_at],
            )
            .map_err(sql("add comment"))?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(sql("add comment"))?;

            Ok(Comment {
                id,
                job_id,
                responder,
                response: text,
                created_at: parse_ts("add comment", &created_at)?,
            })
        })
        .await
    }

    /// Comments on a job in insertion order.
    pub async fn get_comments_for_job(&self, job_id: i64) -> Result<Vec<Comment>, StorageError> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, job_id, responder, response, created_at
                     FROM comments WHERE job_id = ?1 ORDER BY id ASC",
                )
                .map_err(sql("get comments"))?;
            let rows = stmt
                .query_map(params![job_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(sql("get comments"))?;

            let mut comments = Vec::new();
            for row in rows {
                let (id, job_id, responder, response, created_at) =
                    row.map_err(sql("get comments"))?;
                comments.push(Comment {
                    id,
                    job_id,
                    responder,
                    response,
                    created_at: parse_ts("get comments", &created_at)?,
                });
            }
            Ok(comments)
        })
        .await
    }
}
