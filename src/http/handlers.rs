use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::adapters::{FunctionContext, ImportContext, StringContext};
use crate::auth::AuthenticatedCaller;
use crate::error::{AppError, AppResult};
use crate::jobs::JobInput;
use crate::kv::KvStore;
use crate::models::{AnalysisConfig, Job, JobPriority, JobStatus, Scope, TranslationArtifact};

const UPLOAD_RETENTION_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub file_hash: String,
    pub config: AnalysisConfig,
    #[serde(default)]
    pub functions: Vec<FunctionContext>,
    #[serde(default)]
    pub imports: Vec<ImportContext>,
    #[serde(default)]
    pub strings: Vec<StringContext>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

pub async fn submit_job(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(req): Json<SubmitJobRequest>,
) -> AppResult<impl IntoResponse> {
    if !caller.has_scope(Scope::SubmitJob) {
        return Err(AppError::Forbidden("missing submit_job scope".to_string()));
    }

    let decision = state.rate_limiter.check(&caller.record.id, caller.record.tier).await;
    if !decision.allowed {
        state.metrics.record_rate_limit_rejection();
        return Err(AppError::RateLimited {
            retry_after_secs: decision.retry_after_secs.unwrap_or(60),
        });
    }

    if req.file_hash.is_empty() {
        return Err(AppError::Validation {
            message: "file_hash must not be empty".to_string(),
            field: Some("file_hash".to_string()),
        });
    }

    let mut job = Job::new(req.file_hash, req.config, caller.record.id.clone());
    job.priority = req.priority.unwrap_or(JobPriority::Normal);
    job.callback_url = req.callback_url;

    let input = JobInput { functions: req.functions, imports: req.imports, strings: req.strings };

    let job_id = state.jobs.submit(job, input).await.map_err(AppError::Internal)?;
    state.metrics.record_job_submitted();

    Ok(Json(SubmitJobResponse { job_id }))
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_reference: String,
    pub size_bytes: usize,
}

/// Accepts raw binary content and hands back an opaque reference a later
/// `submit_job` call can carry forward. The decompilation engine itself is
/// an external collaborator; this service only holds the bytes long enough
/// for that engine to fetch them.
pub async fn upload(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    body: axum::body::Bytes,
) -> AppResult<impl IntoResponse> {
    if !caller.has_scope(Scope::SubmitJob) {
        return Err(AppError::Forbidden("missing submit_job scope".to_string()));
    }
    if body.len() > state.config.max_upload_bytes {
        return Err(AppError::Validation {
            message: format!("upload exceeds the {}-byte limit", state.config.max_upload_bytes),
            field: None,
        });
    }

    let id = Uuid::new_v4();
    state
        .kv
        .set(&format!("upload:{}", id), &hex::encode(&body), Some(Duration::from_secs(UPLOAD_RETENTION_SECS)))
        .await
        .map_err(|e| AppError::KvUnavailable(e.to_string()))?;

    Ok(Json(UploadResponse { file_reference: format!("upload://{}", id), size_bytes: body.len() }))
}

pub async fn get_job(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Job>> {
    if !caller.has_scope(Scope::ReadJob) {
        return Err(AppError::Forbidden("missing read_job scope".to_string()));
    }

    let job = state
        .jobs
        .get(id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?;

    if job.caller_id != caller.record.id && !caller.has_scope(Scope::Admin) {
        return Err(AppError::Forbidden("job belongs to a different caller".to_string()));
    }

    Ok(Json(job))
}

fn default_page() -> usize { 1 }
fn default_page_size() -> usize { 20 }
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub tag: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

fn status_name(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Timeout => "timeout",
    }
}

/// `GET /jobs` — every job visible to the caller (their own, or every job
/// for an admin key), optionally filtered by status/tag, sorted, and
/// paginated in memory.
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Query(query): Query<ListJobsQuery>,
) -> AppResult<Json<JobListResponse>> {
    if !caller.has_scope(Scope::ReadJob) {
        return Err(AppError::Forbidden("missing read_job scope".to_string()));
    }

    let mut jobs = state.jobs.list().await.map_err(AppError::Internal)?;

    if !caller.has_scope(Scope::Admin) {
        jobs.retain(|j| j.caller_id == caller.record.id);
    }
    if let Some(status) = &query.status {
        jobs.retain(|j| status_name(j.status).eq_ignore_ascii_case(status));
    }
    if let Some(tag) = &query.tag {
        jobs.retain(|j| j.tags.iter().any(|t| t == tag));
    }

    match query.sort_by.as_deref() {
        Some("updated_at") => jobs.sort_by_key(|j| j.updated_at),
        Some("priority") => jobs.sort_by_key(|j| j.priority),
        _ => jobs.sort_by_key(|j| j.created_at),
    }
    if !matches!(query.sort_order.as_deref(), Some(o) if o.eq_ignore_ascii_case("asc")) {
        jobs.reverse();
    }

    let total = jobs.len();
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
    let start = (page - 1) * page_size;
    let jobs = jobs.into_iter().skip(start).take(page_size).collect();

    Ok(Json(JobListResponse { jobs, page, page_size, total }))
}

#[derive(Debug, Serialize)]
pub struct JobResultResponse {
    pub job_id: Uuid,
    pub artifacts: Vec<TranslationArtifact>,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub age_seconds: u64,
}

/// `GET /jobs/{id}/result` — the only way to fetch a completed job's
/// artifacts; 409 while the job hasn't finished, 404 once its cache entry
/// has expired out from under it.
pub async fn job_result(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResultResponse>> {
    if !caller.has_scope(Scope::ReadJob) {
        return Err(AppError::Forbidden("missing read_job scope".to_string()));
    }

    let job = state
        .jobs
        .get(id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?;

    if job.caller_id != caller.record.id && !caller.has_scope(Scope::Admin) {
        return Err(AppError::Forbidden("job belongs to a different caller".to_string()));
    }
    if job.status != JobStatus::Completed {
        return Err(AppError::Conflict(format!(
            "job {} is not completed (status: {})",
            id,
            status_name(job.status)
        )));
    }

    let cache_key = job.result_cache_key.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("completed job is missing its result cache key"))
    })?;

    let cached = state
        .cache
        .get_by_key(&cache_key)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("cached result for job {} has expired", id)))?;

    Ok(Json(JobResultResponse {
        job_id: id,
        artifacts: cached.artifacts,
        cached_at: cached.created_at,
        age_seconds: cached.age_seconds(),
    }))
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Cancel,
    Retry,
    Pause,
    Resume,
    Reset,
}

#[derive(Debug, Deserialize)]
pub struct JobActionRequest {
    pub action: JobAction,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub reset_retry_count: bool,
    #[serde(default)]
    pub new_priority: Option<JobPriority>,
}

#[derive(Debug, Serialize)]
pub struct JobActionResponse {
    pub job_id: Uuid,
    pub previous_status: JobStatus,
    pub new_status: JobStatus,
}

/// `POST /jobs/{id}/actions` — the one mutation endpoint for control
/// operations. `pause`/`resume` are not implemented and are rejected with
/// `unsupported_action` rather than silently accepted.
pub async fn job_actions(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(id): Path<Uuid>,
    Json(req): Json<JobActionRequest>,
) -> AppResult<Json<JobActionResponse>> {
    let current = state
        .jobs
        .get(id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?;

    if current.caller_id != caller.record.id && !caller.has_scope(Scope::Admin) {
        return Err(AppError::Forbidden("job belongs to a different caller".to_string()));
    }
    let previous_status = current.status;

    let updated = match req.action {
        JobAction::Cancel => {
            if !caller.has_scope(Scope::CancelJob) {
                return Err(AppError::Forbidden("missing cancel_job scope".to_string()));
            }
            let job = state
                .jobs
                .cancel(id, req.force)
                .await
                .map_err(AppError::Internal)?
                .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?;
            state.metrics.record_job_cancelled();
            job
        }
        JobAction::Retry => {
            if !caller.has_scope(Scope::SubmitJob) {
                return Err(AppError::Forbidden("missing submit_job scope".to_string()));
            }
            if previous_status != JobStatus::Failed {
                return Err(AppError::Conflict("only failed jobs can be retried".to_string()));
            }
            state
                .jobs
                .retry(id, req.reset_retry_count)
                .await
                .map_err(AppError::Internal)?
                .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?
        }
        JobAction::Reset => {
            if !caller.has_scope(Scope::SubmitJob) {
                return Err(AppError::Forbidden("missing submit_job scope".to_string()));
            }
            if previous_status.is_terminal() {
                return Err(AppError::Conflict("cannot reset a terminal job".to_string()));
            }
            state
                .jobs
                .reset(id, req.new_priority)
                .await
                .map_err(AppError::Internal)?
                .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?
        }
        JobAction::Pause | JobAction::Resume => {
            let name = match req.action {
                JobAction::Pause => "pause",
                JobAction::Resume => "resume",
                _ => unreachable!(),
            };
            return Err(AppError::UnsupportedAction(name.to_string()));
        }
    };

    Ok(Json(JobActionResponse { job_id: id, previous_status, new_status: updated.status }))
}

#[derive(Debug, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub display_name: String,
    pub enabled: bool,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub circuit_state: crate::models::CircuitState,
}

pub async fn list_providers(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
) -> AppResult<Json<Vec<ProviderSummary>>> {
    if !caller.has_scope(Scope::Admin) {
        return Err(AppError::Forbidden("missing admin scope".to_string()));
    }

    let summaries = state
        .providers
        .all()
        .map(|entry| {
            let stats = entry.stats.lock();
            let health = entry.health.lock();
            ProviderSummary {
                id: entry.config.id.clone(),
                display_name: entry.config.display_name.clone(),
                enabled: entry.config.enabled,
                success_rate: stats.success_rate(),
                avg_latency_ms: stats.avg_latency_ms,
                circuit_state: health.circuit_state,
            }
        })
        .collect();

    Ok(Json(summaries))
}

#[derive(Debug, Serialize)]
pub struct ProviderDetail {
    pub id: String,
    pub display_name: String,
    pub kind: crate::models::ProviderKind,
    pub enabled: bool,
    pub default_model: String,
    pub stats: crate::models::ProviderStats,
    pub health: crate::models::ProviderHealth,
}

pub async fn provider_detail(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(id): Path<String>,
) -> AppResult<Json<ProviderDetail>> {
    if !caller.has_scope(Scope::Admin) {
        return Err(AppError::Forbidden("missing admin scope".to_string()));
    }

    let entry = state
        .providers
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("provider {} not found", id)))?;

    Ok(Json(ProviderDetail {
        id: entry.config.id.clone(),
        display_name: entry.config.display_name.clone(),
        kind: entry.config.kind,
        enabled: entry.config.enabled,
        default_model: entry.config.default_model.clone(),
        stats: entry.stats.lock().clone(),
        health: entry.health.lock().clone(),
    }))
}

pub async fn provider_health_check(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(id): Path<String>,
) -> AppResult<Json<crate::adapters::ProviderHealthProbe>> {
    if !caller.has_scope(Scope::Admin) {
        return Err(AppError::Forbidden("missing admin scope".to_string()));
    }

    let entry = state
        .providers
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("provider {} not found", id)))?;

    let key = entry.config.api_key.as_deref().unwrap_or("");
    let probe = entry
        .adapter
        .check_health(key)
        .await
        .map_err(|e| AppError::ProviderError(e.to_string()))?;

    Ok(Json(probe))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render_prometheus(&state.providers)
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let _ = Arc::clone(&state.config);
    Json(serde_json::json!({ "status": "ok" }))
}
