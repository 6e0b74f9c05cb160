//! HTTP API server
//!
//! Thin façade over the dispatcher and state store: submission, status,
//! artifact download, a server-sent progress feed, job counters and the
//! remote-worker handoff route.

use crate::dispatch::{DispatchError, Dispatcher, JobLauncher, REMOTE_RUN_PATH};
use crate::jobs::{current_timestamp_ms, mime_for_file_name, ConvertRequest, Job, JobStatus, StateRecord};
use crate::metrics::{collect_job_counts, JobCounts};
use crate::store::{update_record, SharedStore, StoreError};
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Handler error, rendered as `{"error", "code"}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidSource(msg) => ApiError::BadRequest(msg),
            DispatchError::AlreadyRunning(id) => ApiError::Conflict(format!("job {} is already running", id)),
            DispatchError::Store(e) => ApiError::Store(e),
            DispatchError::Remote(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "state store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub dispatcher: Arc<Dispatcher>,
    /// Runs jobs received on the handoff route in this process
    pub runner: Arc<dyn JobLauncher>,
    pub delete_after_download: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

/// Run filesystem-backed store work on the blocking pool.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {}", e)))?
}

async fn read_record(store: &SharedStore, job_id: &str) -> ApiResult<Option<StateRecord>> {
    let store = store.clone();
    let job_id = job_id.to_string();
    blocking(move || Ok(store.get(&job_id)?)).await
}

async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(request) = payload?;
    let dispatcher = state.dispatcher.clone();
    let job_id = blocking(move || Ok(dispatcher.submit(request)?)).await?;
    Ok(Json(SubmitResponse { job_id }))
}

async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StateRecord>> {
    read_record(&state.store, &job_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(job_id))
}

/// Stream the artifact; after the last chunk the record is marked downloaded
/// (and the file removed when configured). A client that disconnects early
/// leaves the record untouched.
async fn download_artifact(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let record = read_record(&state.store, &job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(job_id.clone()))?;

    let (path, file_name) = match (downloadable_path(&record), record.file_name) {
        (Some(path), Some(name)) => (path, name),
        _ => return Err(ApiError::NotFound(job_id)),
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound(job_id)),
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };
    let file_size = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .len();

    let store = state.store.clone();
    let delete_after = state.delete_after_download;
    let finalize = stream::once(async move {
        let finished = tokio::task::spawn_blocking(move || {
            finalize_download(&store, &job_id, &path, delete_after)
        });
        if let Err(e) = finished.await {
            tracing::error!(error = %e, "download finalization task failed");
        }
    })
    .filter_map(|()| async { None::<std::io::Result<Bytes>> });
    let body = Body::from_stream(ReaderStream::new(file).chain(finalize));

    let headers = [
        (header::CONTENT_TYPE, mime_for_file_name(&file_name).to_string()),
        (header::CONTENT_LENGTH, file_size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
    ];
    Ok((headers, body).into_response())
}

fn finalize_download(store: &SharedStore, job_id: &str, path: &std::path::Path, delete_after: bool) {
    let result = (|| -> Result<(), StoreError> {
        update_record(store.as_ref(), job_id, StateRecord::mark_downloaded)?;
        if delete_after {
            let removed = store.delete_file(path)?;
            update_record(store.as_ref(), job_id, |r| r.mark_deleted(current_timestamp_ms()))?;
            tracing::info!(job_id = %job_id, removed, "artifact deleted after download");
        }
        store.commit()
    })();
    if let Err(e) = result {
        tracing::warn!(job_id = %job_id, error = %e, "could not finalize download");
    }
}

/// Poll a job's record every `interval` until it is terminal.
///
/// Each tick sends one record; the terminal record is sent exactly once and
/// ends the feed. The feed also ends when the record disappears or cannot be
/// read, or when the receiver is dropped. The job itself is never touched.
pub fn progress_feed(store: SharedStore, job_id: String, interval: Duration) -> ReceiverStream<StateRecord> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => break,
            }
            let read = {
                let store = store.clone();
                let job_id = job_id.clone();
                tokio::task::spawn_blocking(move || store.get(&job_id)).await
            };
            let record = match read {
                Ok(Ok(Some(record))) => record,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    tracing::warn!(job_id = %job_id, error = %e, "progress feed read failed");
                    break;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "progress feed task failed");
                    break;
                }
            };
            let terminal = record.is_terminal();
            if tx.send(record).await.is_err() || terminal {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

async fn progress_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    if read_record(&state.store, &job_id).await?.is_none() {
        return Err(ApiError::NotFound(job_id));
    }
    let feed = progress_feed(state.store.clone(), job_id, state.poll_interval)
        .map(|record| Event::default().json_data(&record));
    Ok(Sse::new(feed))
}

async fn get_metrics(State(state): State<AppState>) -> ApiResult<Json<JobCounts>> {
    let store = state.store.clone();
    let counts = blocking(move || Ok(collect_job_counts(store.as_ref())?)).await?;
    Ok(Json(counts))
}

/// Handoff from a dispatcher in another process; the record already exists
/// in the shared store.
async fn run_remote_job(
    State(state): State<AppState>,
    payload: Result<Json<Job>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(job) = payload?;
    if read_record(&state.store, &job.id).await?.is_none() {
        return Err(ApiError::NotFound(job.id));
    }
    let job_id = job.id.clone();
    state.runner.launch(job)?;
    tracing::info!(job_id = %job_id, "accepted job from dispatcher");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// Creates the axum Router with all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/submit", post(submit_job))
        .route("/status/:job_id", get(get_status))
        .route("/download/:job_id", get(download_artifact))
        .route("/progress/:job_id/events", get(progress_events))
        .route("/metrics", get(get_metrics))
        .route(REMOTE_RUN_PATH, post(run_remote_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the API server on `bind_addr` until `shutdown` resolves
pub async fn run_server<F>(state: AppState, bind_addr: &str, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "API server listening");
    }

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Path of the artifact a download would serve, if any.
pub fn downloadable_path(record: &StateRecord) -> Option<PathBuf> {
    match record.status {
        JobStatus::Completed if !record.deleted => record.file_path.clone(),
        _ => None,
    }
}
