//! Read-only HTTP status view over the job store and encoder progress.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::jobs::Job;
use crate::progress::{ProgressMonitor, ProgressReport};
use crate::store::{JobStore, StoreError};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status server failed: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct StatusState {
    pub store: Arc<dyn JobStore>,
    pub monitor: Arc<ProgressMonitor>,
}

/// Error body returned by the handlers.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "Job store read failed");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn find_job(state: &StatusState, id: &str) -> Result<Job, ApiError> {
    state
        .store
        .get(id)?
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("Job not found: {}", id)))
}

/// GET /jobs
async fn list_jobs(State(state): State<StatusState>) -> Result<Json<Vec<Job>>, ApiError> {
    let mut jobs = state.store.list()?;
    jobs.sort_by_key(|j| j.seq);
    Ok(Json(jobs))
}

/// GET /jobs/:id
async fn get_job(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(find_job(&state, &id)?))
}

/// GET /jobs/:id/progress
async fn get_progress(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Result<Json<ProgressReport>, ApiError> {
    find_job(&state, &id)?;
    let progress = state.monitor.progress(&id);
    Ok(Json(ProgressReport::new(&id, progress)))
}

pub fn create_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/progress", get(get_progress))
        .with_state(state)
}

/// Serve the status view on `bind` until `shutdown` is cancelled.
pub async fn run_status_server(
    bind: &str,
    state: StatusState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_status_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = bind, "Status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
