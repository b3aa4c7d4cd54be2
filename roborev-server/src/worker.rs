//! The worker pool: long-lived tasks that poll the store, claim jobs,
//! dispatch agents and commit results.
//!
//! Shutdown never interrupts a job in flight. The stop signal is
//! checked between poll iterations only, so a worker that has claimed a
//! job finishes it and commits the result before exiting; losing a
//! completed review to a restart would be worse than a slow shutdown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use roborev_core::config::RepoConfig;
use roborev_core::prompt::{build_prompt, ReviewContext};

use crate::agent::{AgentError, AgentRegistry};
use crate::storage::{Job, Storage};

/// Poll interval when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Longer backoff after a store error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Per-job budget handed to the agent.
const JOB_DEADLINE: Duration = Duration::from_secs(600);
/// How long `stop` waits for in-flight jobs before giving up.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

pub struct WorkerPool {
    storage: Storage,
    registry: Arc<AgentRegistry>,
    num_workers: usize,
    shutdown_timeout: Duration,
    active: Arc<AtomicI64>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(storage: Storage, registry: Arc<AgentRegistry>, num_workers: usize) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            storage,
            registry,
            num_workers,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            active: Arc::new(AtomicI64::new(0)),
            stop_tx,
            handles: Vec::new(),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Counter of workers currently processing a job, shared with the
    /// control server's status endpoint.
    pub fn active_handle(&self) -> Arc<AtomicI64> {
        self.active.clone()
    }

    pub fn active_workers(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) {
        info!(workers = self.num_workers, "starting worker pool");
        for i in 0..self.num_workers {
            let worker_id = format!("worker-{i}");
            let storage = self.storage.clone();
            let registry = self.registry.clone();
            let active = self.active.clone();
            let stop_rx = self.stop_tx.subscribe();
            self.handles.push(tokio::spawn(worker_loop(
                worker_id, storage, registry, active, stop_rx,
            )));
        }
    }

    /// Signal stop and wait for workers, bounded by the shutdown
    /// timeout. Lingering workers are orphaned with the process.
    pub async fn stop(&mut self) {
        info!("stopping worker pool");
        let _ = self.stop_tx.send(true);

        let handles: Vec<_> = self.handles.drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "shutdown timeout elapsed; abandoning remaining workers"
            );
            return;
        }
        info!("worker pool stopped");
    }
}

/// Sleep for `duration`, waking early on the stop signal.
/// Returns `true` when stop was requested.
async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop_rx.borrow(),
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}

async fn worker_loop(
    worker_id: String,
    storage: Storage,
    registry: Arc<AgentRegistry>,
    active: Arc<AtomicI64>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(worker = %worker_id, "started");

    loop {
        if *stop_rx.borrow() {
            info!(worker = %worker_id, "shutting down");
            return;
        }

        match storage.claim_job(&worker_id).await {
            Err(e) => {
                error!(worker = %worker_id, error = %e, "error claiming job");
                if sleep_or_stop(&mut stop_rx, ERROR_BACKOFF).await {
                    info!(worker = %worker_id, "shutting down");
                    return;
                }
            }
            Ok(None) => {
                if sleep_or_stop(&mut stop_rx, POLL_INTERVAL).await {
                    info!(worker = %worker_id, "shutting down");
                    return;
                }
            }
            Ok(Some(job)) => {
                active.fetch_add(1, Ordering::SeqCst);
                process_job(&worker_id, &storage, &registry, &job).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

async fn process_job(worker_id: &str, storage: &Storage, registry: &AgentRegistry, job: &Job) {
    info!(
        worker = %worker_id,
        job = job.id,
        commit = %job.commit_sha,
        repo = %job.repo_name,
        "processing job"
    );

    let repo_cfg = match RepoConfig::load(Path::new(&job.repo_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(worker = %worker_id, job = job.id, error = %e, "ignoring bad repo config");
            RepoConfig::default()
        }
    };

    let prompt = match build_job_prompt(storage, job, &repo_cfg).await {
        Ok(prompt) => prompt,
        Err(e) => {
            error!(worker = %worker_id, job = job.id, error = %e, "error building prompt");
            record_failure(storage, job.id, &format!("build prompt: {e}")).await;
            return;
        }
    };

    let agent = match registry.get(&job.agent) {
        Ok(agent) => agent,
        Err(e) => {
            error!(worker = %worker_id, job = job.id, error = %e, "error getting agent");
            record_failure(storage, job.id, &format!("get agent: {e}")).await;
            return;
        }
    };
    let agent = match &job.model {
        Some(model) => agent.with_model(model),
        None => agent,
    };
    let agent = match job.reasoning.or(repo_cfg.reasoning) {
        Some(level) => agent.with_reasoning(level),
        None => agent,
    };

    info!(worker = %worker_id, job = job.id, agent = %job.agent, "running review");
    let outcome = tokio::time::timeout(
        JOB_DEADLINE,
        agent.review(Path::new(&job.repo_path), &job.commit_sha, &prompt, None),
    )
    .await;

    match outcome {
        Err(_elapsed) => {
            error!(worker = %worker_id, job = job.id, "job deadline exceeded");
            record_failure(storage, job.id, &format!("agent: {}", AgentError::Timeout)).await;
        }
        Ok(Err(e)) => {
            error!(worker = %worker_id, job = job.id, error = %e, "agent error");
            record_failure(storage, job.id, &format!("agent: {e}")).await;
        }
        Ok(Ok(output)) => {
            if let Err(e) = storage
                .complete_job(job.id, &job.agent, &prompt, &output)
                .await
            {
                error!(worker = %worker_id, job = job.id, error = %e, "error storing review");
            } else {
                info!(worker = %worker_id, job = job.id, "completed job");
            }
        }
    }
}

/// Fetch recent-review context, then assemble the prompt off the async
/// runtime (it shells out to git).
async fn build_job_prompt(
    storage: &Storage,
    job: &Job,
    repo_cfg: &RepoConfig,
) -> anyhow::Result<String> {
    let context_count = repo_cfg.context_count();
    let contexts: Vec<ReviewContext> = if context_count > 0 {
        storage
            .get_recent_reviews(job.repo_id, context_count)
            .await?
            .into_iter()
            .map(|r| ReviewContext {
                agent: r.agent,
                output: r.output,
            })
            .collect()
    } else {
        Vec::new()
    };

    let repo_path = PathBuf::from(&job.repo_path);
    let sha = job.commit_sha.clone();
    let guidelines = repo_cfg.review_guidelines.clone();
    let prompt = tokio::task::spawn_blocking(move || {
        build_prompt(&repo_path, &sha, context_count, guidelines.as_deref(), |_| {
            contexts
        })
    })
    .await?;
    Ok(prompt)
}

async fn record_failure(storage: &Storage, job_id: i64, message: &str) {
    if let Err(e) = storage.fail_job(job_id, message).await {
        error!(job = job_id, error = %e, "error recording job failure");
    }
}
