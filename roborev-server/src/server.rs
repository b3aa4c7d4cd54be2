//! The local control API: enqueue, status, job listing, review
//! retrieval, comments and shutdown. JSON in, JSON out, loopback only.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use roborev_core::config::{resolve_agent, resolve_model, GlobalConfig, ReasoningLevel};
use roborev_core::git;

use crate::agent::{validate_model_name, AgentRegistry};
use crate::storage::{
    Comment, EnqueueOpts, EnqueueTarget, Job, JobStatus, Review, Storage, StorageError,
};

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub registry: Arc<AgentRegistry>,
    pub global_config: Arc<GlobalConfig>,
    pub active_workers: Arc<AtomicI64>,
    pub max_workers: usize,
    /// Daemon-wide shutdown signal. Flipping it stops new enqueues and
    /// drains the listener; in-flight jobs are left to finish.
    pub shutdown: watch::Sender<bool>,
}

/// Classified errors mapped onto HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Validation(String),
    Unavailable(String),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound("not found".to_string()),
            StorageError::Conflict(msg) => ApiError::Conflict(msg),
            StorageError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/enqueue", post(enqueue))
        .route("/api/status", get(status))
        .route("/api/jobs", get(list_jobs))
        .route("/api/job", get(get_job))
        .route("/api/review", get(get_review))
        .route("/api/review/address", post(address_review))
        .route("/api/comment", post(add_comment))
        .route("/api/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    repo_path: String,
    #[serde(rename = "commitSHA", alias = "commitSha")]
    commit_sha: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    job_id: i64,
}

async fn enqueue(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if *state.shutdown.borrow() {
        return Err(ApiError::Unavailable("daemon is shutting down".to_string()));
    }
    if req.repo_path.trim().is_empty() {
        return Err(ApiError::Validation("repoPath is required".to_string()));
    }
    if req.commit_sha.trim().is_empty() {
        return Err(ApiError::Validation("commitSHA is required".to_string()));
    }

    let repo_cfg = roborev_core::config::RepoConfig::load(Path::new(&req.repo_path))
        .unwrap_or_default();
    let agent_name = resolve_agent(req.agent.as_deref(), &repo_cfg, &state.global_config);
    state
        .registry
        .get(&agent_name)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let model = resolve_model(req.model.as_deref(), &repo_cfg, &state.global_config);
    if let Some(model) = &model {
        validate_model_name(model).map_err(|e| ApiError::Validation(e.to_string()))?;
    }
    let reasoning = match req.reasoning.as_deref().filter(|r| !r.is_empty()) {
        Some(raw) => Some(
            raw.parse::<ReasoningLevel>()
                .map_err(ApiError::Validation)?,
        ),
        None => repo_cfg.reasoning,
    };

    let repo = state.storage.get_or_create_repo(&req.repo_path).await?;

    // Commit metadata is best-effort: the hook hands us a resolved SHA,
    // but the path may not be a readable repository from the daemon.
    let repo_path = req.repo_path.clone();
    let sha = req.commit_sha.clone();
    let info = tokio::task::spawn_blocking(move || {
        git::commit_info(Path::new(&repo_path), &sha).ok()
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let commit = match info {
        Some(info) => {
            state
                .storage
                .get_or_create_commit(
                    repo.id,
                    &req.commit_sha,
                    &info.author,
                    &info.subject,
                    info.timestamp,
                )
                .await?
        }
        None => {
            state
                .storage
                .get_or_create_commit(repo.id, &req.commit_sha, "", "", chrono::Utc::now())
                .await?
        }
    };

    let job = state
        .storage
        .enqueue_job(EnqueueOpts {
            repo_id: repo.id,
            target: EnqueueTarget::CommitId(commit.id),
            agent: agent_name,
            model,
            reasoning,
        })
        .await?;

    info!(job = job.id, commit = %job.commit_sha, agent = %job.agent, "enqueued review");
    Ok(Json(EnqueueResponse { job_id: job.id }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    active_workers: i64,
    max_workers: usize,
    queued_jobs: i64,
    running_jobs: i64,
    completed_jobs: i64,
    failed_jobs: i64,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let counts = state.storage.job_counts().await?;
    Ok(Json(StatusResponse {
        active_workers: state.active_workers.load(Ordering::SeqCst),
        max_workers: state.max_workers,
        queued_jobs: counts.queued,
        running_jobs: counts.running,
        completed_jobs: counts.done,
        failed_jobs: counts.failed,
    }))
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<JobStatus>().map_err(ApiError::Validation)?),
        None => None,
    };
    let jobs = state.storage.list_jobs(status, query.limit).await?;
    Ok(Json(JobsResponse { jobs }))
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    id: i64,
}

async fn get_job(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.storage.get_job(query.id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewQuery {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    job_id: Option<i64>,
}

async fn get_review(
    State(state): State<AppState>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Review>, ApiError> {
    let review = match (query.sha.as_deref().filter(|s| !s.is_empty()), query.job_id) {
        (Some(sha), _) => state.storage.get_review_by_commit_sha(sha).await?,
        (None, Some(job_id)) => state.storage.get_review_by_job_id(job_id).await?,
        (None, None) => {
            return Err(ApiError::Validation(
                "sha or jobId query parameter is required".to_string(),
            ))
        }
    };
    Ok(Json(review))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressRequest {
    review_id: i64,
    addressed: bool,
}

async fn address_review(
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .storage
        .set_review_addressed(req.review_id, req.addressed)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentRequest {
    job_id: i64,
    responder: String,
    text: String,
}

async fn add_comment(
    State(state): State<AppState>,
    Json(req): Json<CommentRequest>,
) -> Result<Json<Comment>, ApiError> {
    let comment = state
        .storage
        .add_comment(req.job_id, &req.responder, &req.text)
        .await?;
    Ok(Json(comment))
}

async fn shutdown(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("shutdown requested over the control API");
    state.shutdown.send_replace(true);
    Json(json!({ "success": true }))
}
