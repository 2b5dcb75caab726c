//! HTTP job API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use srtgen::queue::{resolve_in_root, BatchError};
use srtgen::{BatchOutcome, Error, Job, JobId, JobQueue, JobRequest, JobStatus, Language, Settings, SettingsUpdate};

#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    pub media_root: Arc<PathBuf>,
}

impl AppState {
    pub fn new(queue: JobQueue, media_root: impl Into<PathBuf>) -> Self {
        Self {
            queue,
            media_root: Arc::new(media_root.into()),
        }
    }

    fn resolve(&self, relative: &Path) -> srtgen::Result<PathBuf> {
        resolve_in_root(&self.media_root, relative)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(enqueue).get(list_jobs))
        .route("/api/jobs/batch", post(enqueue_batch))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/bump", post(bump_job))
        .route("/api/history", get(list_history).delete(delete_history))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/languages", get(list_languages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Library errors rendered as JSON responses.
#[derive(Debug)]
pub struct ApiError(Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::InvalidState { .. } | Error::Settings(_) => StatusCode::BAD_REQUEST,
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }

        let body = match &self.0 {
            Error::Conflict { paths } => json!({
                "error": "Output files already exist",
                "existing_files": paths,
            }),
            e => json!({ "error": e.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct Enqueued {
    job_id: JobId,
}

async fn enqueue(State(state): State<AppState>, Json(mut request): Json<JobRequest>) -> ApiResult<Json<Enqueued>> {
    request.path = state.resolve(&request.path)?;
    let job_id = state.queue.enqueue(request)?;
    info!(job_id, "job queued");
    Ok(Json(Enqueued { job_id }))
}

#[derive(Deserialize)]
struct BatchRequest {
    paths: Vec<PathBuf>,
    #[serde(flatten)]
    options: JobRequest,
}

async fn enqueue_batch(State(state): State<AppState>, Json(batch): Json<BatchRequest>) -> Json<BatchOutcome> {
    let mut resolved = Vec::with_capacity(batch.paths.len());
    let mut unresolved = Vec::new();
    for path in batch.paths {
        match state.resolve(&path) {
            Ok(p) => resolved.push(p),
            Err(e) => unresolved.push(BatchError {
                path,
                error: e.to_string(),
            }),
        }
    }

    let mut outcome = state.queue.enqueue_batch(resolved, &batch.options);
    outcome.errors.extend(unresolved);
    info!(
        queued = outcome.queued.len(),
        skipped = outcome.skipped,
        conflicts = outcome.conflicts.len(),
        errors = outcome.errors.len(),
        "batch queued"
    );
    Json(outcome)
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.queue.list_active())
}

async fn get_job(State(state): State<AppState>, UrlPath(id): UrlPath<JobId>) -> ApiResult<Json<Job>> {
    state.queue.get(id).map(Json).ok_or(ApiError(Error::JobNotFound(id)))
}

async fn cancel_job(State(state): State<AppState>, UrlPath(id): UrlPath<JobId>) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.cancel(id)?))
}

async fn bump_job(State(state): State<AppState>, UrlPath(id): UrlPath<JobId>) -> ApiResult<StatusCode> {
    state.queue.bump(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HistoryQuery {
    /// Comma-separated statuses.
    status: Option<String>,
}

impl HistoryQuery {
    fn statuses(&self) -> srtgen::Result<Option<Vec<JobStatus>>> {
        let Some(raw) = self.status.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        raw.split(',').map(str::parse).collect::<srtgen::Result<Vec<_>>>().map(Some)
    }
}

async fn list_history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> ApiResult<Json<Vec<Job>>> {
    let statuses = query.statuses()?;
    Ok(Json(state.queue.history(statuses.as_deref())))
}

#[derive(Serialize)]
struct Deleted {
    deleted: usize,
}

async fn delete_history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> ApiResult<Json<Deleted>> {
    let deleted = match query.statuses()? {
        Some(statuses) => state.queue.delete_history(&statuses)?,
        None => state.queue.clear_history()?,
    };
    Ok(Json(Deleted { deleted }))
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.queue.settings().get())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<Settings>> {
    let settings = state.queue.settings().update(update)?;
    state.queue.reschedule();
    Ok(Json(settings))
}

#[derive(Serialize)]
struct LanguageInfo {
    code: &'static str,
    name: &'static str,
}

async fn list_languages() -> Json<Vec<LanguageInfo>> {
    Json(
        Language::supported()
            .iter()
            .map(|lang| LanguageInfo {
                code: lang.code(),
                name: lang.name(),
            })
            .collect(),
    )
}
