//! Review job lifecycle: enqueue, atomic claim, completion, failure,
//! cancellation, listing and counts.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use roborev_core::config::ReasoningLevel;

use super::{
    commits, now_rfc3339, parse_ts, parse_ts_opt, sql, Job, JobCounts, JobStatus, Storage,
    StorageError,
};

/// What a new job should review.
#[derive(Debug, Clone)]
pub enum EnqueueTarget {
    /// An existing commit row.
    CommitId(i64),
    /// A git ref (SHA); resolved against existing commits, creating a
    /// minimal commit row when the SHA has not been seen before.
    GitRef(String),
}

#[derive(Debug, Clone)]
pub struct EnqueueOpts {
    pub repo_id: i64,
    pub target: EnqueueTarget,
    pub agent: String,
    pub model: Option<String>,
    pub reasoning: Option<ReasoningLevel>,
}

const JOB_SELECT: &str = "\
    SELECT j.id, j.repo_id, j.commit_id, j.agent, j.model, j.reasoning, j.status,
           j.enqueued_at, j.started_at, j.finished_at, j.worker_id, j.error,
           r.root_path, r.name, c.sha, c.subject
    FROM review_jobs j
    JOIN repos r ON r.id = j.repo_id
    JOIN commits c ON c.id = j.commit_id";

/// Column values as they come off the wire, before timestamp/enum
/// conversion. Conversion happens outside the rusqlite row closure so
/// errors surface as `StorageError` rather than panics.
struct RawJob {
    id: i64,
    repo_id: i64,
    commit_id: i64,
    agent: String,
    model: Option<String>,
    reasoning: Option<String>,
    status: String,
    enqueued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    worker_id: Option<String>,
    error: Option<String>,
    repo_path: String,
    repo_name: String,
    commit_sha: String,
    commit_subject: String,
}

fn raw_job(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        commit_id: row.get(2)?,
        agent: row.get(3)?,
        model: row.get(4)?,
        reasoning: row.get(5)?,
        status: row.get(6)?,
        enqueued_at: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
        worker_id: row.get(10)?,
        error: row.get(11)?,
        repo_path: row.get(12)?,
        repo_name: row.get(13)?,
        commit_sha: row.get(14)?,
        commit_subject: row.get(15)?,
    })
}

fn finish_job(operation: &str, raw: RawJob) -> Result<Job, StorageError> {
    let status = raw
        .status
        .parse::<JobStatus>()
        .map_err(|e| StorageError::storage(operation, e))?;
    let reasoning = raw
        .reasoning
        .map(|r| {
            r.parse::<ReasoningLevel>()
                .map_err(|e| StorageError::storage(operation, e))
        })
        .transpose()?;
    Ok(Job {
        id: raw.id,
        repo_id: raw.repo_id,
        commit_id: raw.commit_id,
        agent: raw.agent,
        model: raw.model,
        reasoning,
        status,
        enqueued_at: parse_ts(operation, &raw.enqueued_at)?,
        started_at: parse_ts_opt(operation, raw.started_at)?,
        finished_at: parse_ts_opt(operation, raw.finished_at)?,
        worker_id: raw.worker_id,
        error: raw.error,
        repo_path: raw.repo_path,
        repo_name: raw.repo_name,
        commit_sha: raw.commit_sha,
        commit_subject: raw.commit_subject,
    })
}

fn job_by_id(
    conn: &Connection,
    operation: &'static str,
    id: i64,
) -> Result<Option<Job>, StorageError> {
    conn.query_row(&format!("{JOB_SELECT} WHERE j.id = ?1"), params![id], raw_job)
        .optional()
        .map_err(sql(operation))?
        .map(|raw| finish_job(operation, raw))
        .transpose()
}

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
    /// Insert a new job in `queued` state.
    pub async fn enqueue_job(&self, opts: EnqueueOpts) -> Result<Job, StorageError> {
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql("enqueue job"))?;

            let commit_id = match &opts.target {
                EnqueueTarget::CommitId(id) => {
                    tx.query_row(
                        "SELECT 1 FROM commits WHERE id = ?1",
                        params![id],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(sql("enqueue job"))?
                    .ok_or(StorageError::NotFound)?;
                    *id
                }
                EnqueueTarget::GitRef(git_ref) => {
                    match commits::commit_id_by_sha(&tx, git_ref)? {
                        Some(id) => id,
                        None => commits::insert_commit(
                            &tx,
                            opts.repo_id,
                            git_ref,
                            "",
                            "",
                            &now_rfc3339(),
                        )?,
                    }
                }
            };

            tx.execute(
                "INSERT INTO review_jobs (repo_id, commit_id, agent, model, reasoning, status, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)",
                params![
                    opts.repo_id,
                    commit_id,
                    opts.agent,
                    opts.model,
                    opts.reasoning.map(|r| r.to_string()),
                    now_rfc3339(),
                ],
            )
            .map_err(sql("enqueue job"))?;
            let id = tx.last_insert_rowid();

            let job = job_by_id(&tx, "enqueue job", id)?.ok_or(StorageError::NotFound)?;
            tx.commit().map_err(sql("enqueue job"))?;
            Ok(job)
        })
        .await
    }

    /// Atomically claim the oldest queued job for `worker_id`.
    ///
    /// The SELECT and UPDATE run inside one transaction, so two
    /// concurrent claimers can never receive the same row. Returns
    /// `None` when nothing is queued. FIFO by `enqueued_at`, then `id`.
    pub async fn claim_job(&self, worker_id: &str) -> Result<Option<Job>, StorageError> {
        let worker_id = worker_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql("claim job"))?;

            let raw = tx
                .query_row(
                    &format!(
                        "{JOB_SELECT} WHERE j.status = 'queued'
                         ORDER BY j.enqueued_at ASC, j.id ASC LIMIT 1"
                    ),
                    [],
                    raw_job,
                )
                .optional()
                .map_err(sql("claim job"))?;

            let Some(mut raw) = raw else {
                return Ok(None);
            };

            let now = now_rfc3339();
            tx.execute(
                "UPDATE review_jobs SET status = 'running', worker_id = ?1, started_at = ?2
                 WHERE id = ?3",
                params![worker_id, now, raw.id],
            )
            .map_err(sql("claim job"))?;
            tx.commit().map_err(sql("claim job"))?;

            raw.status = "running".to_string();
            raw.worker_id = Some(worker_id);
            raw.started_at = Some(now);
            finish_job("claim job", raw).map(Some)
        })
        .await
    }

    /// Mark a job done and store its review in one transaction.
    ///
    /// Fails with `Conflict` when the job is not `running` and
    /// `NotFound` when it does not exist; either way nothing changes.
    pub async fn complete_job(
        &self,
        job_id: i64,
        agent: &str,
        prompt: &str,
        output: &str,
    ) -> Result<(), StorageError> {
        let agent = agent.to_string();
        let prompt = prompt.to_string();
        let output = output.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql("complete job"))?;

            let updated = tx
                .execute(
                    "UPDATE review_jobs SET status = 'done', finished_at = ?1
                     WHERE id = ?2 AND status = 'running'",
                    params![now_rfc3339(), job_id],
                )
                .map_err(sql("complete job"))?;
            if updated == 0 {
                return if job_exists(&tx, job_id)? {
                    Err(StorageError::Conflict(format!(
                        "job {job_id} is not running"
                    )))
                } else {
                    Err(StorageError::NotFound)
                };
            }

            tx.execute(
                "INSERT INTO reviews (job_id, agent, prompt, output, addressed, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![job_id, agent, prompt, output, now_rfc3339()],
            )
            .map_err(sql("complete job"))?;

            tx.commit().map_err(sql("complete job"))
        })
        .await
    }

    /// Mark a job failed with an error message.
    pub async fn fail_job(&self, job_id: i64, error_msg: &str) -> Result<(), StorageError> {
        let error_msg = error_msg.to_string();
        self.blocking(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE review_jobs SET status = 'failed', finished_at = ?1, error = ?2
                     WHERE id = ?3",
                    params![now_rfc3339(), error_msg, job_id],
                )
                .map_err(sql("fail job"))?;
            if updated == 0 {
                return Err(StorageError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Cancel a job from any non-terminal state.
    pub async fn cancel_job(&self, job_id: i64) -> Result<(), StorageError> {
        self.blocking(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE review_jobs SET status = 'canceled', finished_at = ?1
                     WHERE id = ?2 AND status IN ('queued', 'running')",
                    params![now_rfc3339(), job_id],
                )
                .map_err(sql("cancel job"))?;
            if updated == 0 {
                return if job_exists(conn, job_id)? {
                    Err(StorageError::Conflict(format!(
                        "job {job_id} is already terminal"
                    )))
                } else {
                    Err(StorageError::NotFound)
                };
            }
            Ok(())
        })
        .await
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StorageError> {
        self.blocking(move |conn| {
            let mut query = JOB_SELECT.to_string();
            let mut args: Vec<rusqlite::types::Value> = Vec::new();

            if let Some(status) = status {
                query.push_str(" WHERE j.status = ?1");
                args.push(rusqlite::types::Value::Text(status.as_str().to_string()));
            }
            query.push_str(" ORDER BY j.enqueued_at DESC, j.id DESC");
            if let Some(limit) = limit {
                args.push(rusqlite::types::Value::Integer(limit as i64));
                query.push_str(&format!(" LIMIT ?{}", args.len()));
            }

            let mut stmt = conn.prepare(&query).map_err(sql("list jobs"))?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), raw_job)
                .map_err(sql("list jobs"))?;

            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(finish_job("list jobs", row.map_err(sql("list jobs"))?)?);
            }
            Ok(jobs)
        })
        .await
    }

    /// Fetch a single job with its repo and commit metadata.
    pub async fn get_job(&self, id: i64) -> Result<Job, StorageError> {
        self.blocking(move |conn| {
            job_by_id(conn, "get job", id)?.ok_or(StorageError::NotFound)
        })
        .await
    }

    /// Exact per-status counts, straight from a grouped query.
    pub async fn job_counts(&self) -> Result<JobCounts, StorageError> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM review_jobs GROUP BY status")
                .map_err(sql("job counts"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sql("job counts"))?;

            let mut counts = JobCounts::default();
            for row in rows {
                let (status, count) = row.map_err(sql("job counts"))?;
                match status.parse::<JobStatus>() {
                    Ok(JobStatus::Queued) => counts.queued = count,
                    Ok(JobStatus::Running) => counts.running = count,
                    Ok(JobStatus::Done) => counts.done = count,
                    Ok(JobStatus::Failed) => counts.failed = count,
                    Ok(JobStatus::Canceled) | Err(_) => {}
                }
            }
            Ok(counts)
        })
        .await
    }
}
