use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::commands::build_queue;
use crate::core::QueueManager;
use crate::error::{AnalyzerError, QueueError};
use crate::models::{Disposition, JobStatusView};

/// Options for the HTTP service
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: SocketAddr,
    pub transcripts: PathBuf,
    pub config_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub budget: Option<u32>,
}

#[derive(Clone)]
pub struct AppState {
    pub queue: QueueManager,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub media_ref: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub force_reanalysis: bool,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub job_id: String,
    #[serde(flatten)]
    pub disposition: Disposition,
}

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// An active job already covers this media
    ActiveJob { job_id: String },
    Unavailable(String),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => ApiError::NotFound(err.to_string()),
            QueueError::AlreadyTerminal { .. } => ApiError::Conflict(err.to_string()),
            QueueError::InvalidMediaRef(_) => ApiError::BadRequest(err.to_string()),
            QueueError::ShuttingDown | QueueError::Store(_) => ApiError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            ApiError::ActiveJob { job_id } => (
                StatusCode::CONFLICT,
                serde_json::json!({
                    "job_id": job_id,
                    "error": "an analysis for this media is already in progress",
                }),
            ),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({ "error": msg })),
        };

        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/analyze", post(analyze))
        .route("/api/v1/jobs/:id", get(job_status).delete(cancel_job))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn analyze(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let enqueued = state
        .queue
        .enqueue(&body.media_ref, body.priority, body.force_reanalysis)
        .await?;

    if enqueued.disposition == Disposition::AlreadyActive {
        return Err(ApiError::ActiveJob {
            job_id: enqueued.job_id,
        });
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            job_id: enqueued.job_id,
            disposition: enqueued.disposition,
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.queue.status(&id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.queue.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Run the worker pool behind the HTTP API until Ctrl-C
pub async fn serve(options: ServeOptions) -> Result<(), AnalyzerError> {
    let (_config, queue) = build_queue(
        options.config_path.as_deref(),
        options.workers,
        options.budget,
        &options.transcripts,
    )?;
    queue.start();

    let app = router(AppState { queue: queue.clone() });
    let listener = tokio::net::TcpListener::bind(options.bind).await?;
    info!("Listening on {}", options.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.shutdown().await;
    Ok(())
}
