//! HTTP API for uploads, job status and questions.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload` | Multipart upload (field `file`, `.pdf` or `.txt`); queues ingestion |
//! | `GET`  | `/status/{job_id}` | Current state of an ingestion job |
//! | `POST` | `/ask` | Answer a question from the indexed documents |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must be between 3 and 500 characters" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends on
//! other origins can call the API.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::RagError;
use crate::extract::is_supported;
use crate::jobs::JobTracker;
use crate::models::{ContextChunk, Job, JobStatus};
use crate::pipeline::RetrievalPipeline;

/// Largest accepted request body (uploads included).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<RetrievalPipeline>,
    jobs: Arc<JobTracker>,
    uploads_dir: PathBuf,
}

/// Starts the HTTP server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(RetrievalPipeline::from_config(config)?);
    let jobs = Arc::new(JobTracker::new(config.data.jobs_path()));
    let state = AppState {
        pipeline,
        jobs,
        uploads_dir: config.data.uploads_dir(),
    };

    let app = router(state);
    let bind_addr = &config.server.bind;
    println!("docqa server listening on http://{}", bind_addr);
    info!(bind = %bind_addr, data_dir = %config.data.dir.display(), "server started");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/status/{job_id}", get(handle_status))
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::UnsupportedFormat(_) | RagError::InvalidInput(_) => {
                bad_request(err.to_string())
            }
            RagError::JobNotFound(_) => not_found(err.to_string()),
            other => {
                warn!(error = %other, "request failed");
                internal(other.to_string())
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    job_id: String,
    status: JobStatus,
}

/// Strip any directory components a client put in the filename.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

/// Handler for `POST /upload`.
///
/// Rejects anything but `.pdf`/`.txt` with 400 before writing to disk. The
/// file is stored under `uploads/` and ingested by a background task; poll
/// `GET /status/{job_id}` for the outcome.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .and_then(sanitize_filename)
            .ok_or_else(|| bad_request("upload is missing a filename"))?;
        if !is_supported(&filename) {
            return Err(bad_request("Only PDF and TXT files are supported"));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;

        tokio::fs::create_dir_all(&state.uploads_dir)
            .await
            .map_err(|e| internal(format!("failed to create upload dir: {}", e)))?;
        let path = state
            .uploads_dir
            .join(format!("{}_{}", uuid::Uuid::new_v4(), filename));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| internal(format!("failed to store upload: {}", e)))?;

        let job = state
            .pipeline
            .submit(path, &filename, state.jobs.clone())
            .await?;
        info!(job_id = %job.id, filename = %filename, bytes = bytes.len(), "upload accepted");
        return Ok(Json(UploadResponse {
            job_id: job.id,
            status: job.status,
        }));
    }
    Err(bad_request("multipart field 'file' is required"))
}

// ============ GET /status/{job_id} ============

async fn handle_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = state.jobs.run_blocking(move |t| t.get(&job_id)).await?;
    Ok(Json(job))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct AskResponseBody {
    answer: String,
    contexts: Vec<ContextChunk>,
    sources: Vec<String>,
    latency_ms: u64,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponseBody>, AppError> {
    let resp = state.pipeline.ask(&req.question, req.top_k).await?;
    let sources = resp.sources();
    Ok(Json(AskResponseBody {
        answer: resp.answer,
        contexts: resp.contexts,
        sources,
        latency_ms: resp.latency_ms,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_lose_directories() {
        assert_eq!(sanitize_filename("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(
            sanitize_filename("../../etc/notes.txt").as_deref(),
            Some("notes.txt")
        );
        assert_eq!(
            sanitize_filename("C:\\docs\\scan.pdf").as_deref(),
            Some("scan.pdf")
        );
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (RagError::UnsupportedFormat(".png".into()), StatusCode::BAD_REQUEST),
            (RagError::InvalidInput("top_k".into()), StatusCode::BAD_REQUEST),
            (RagError::JobNotFound("x".into()), StatusCode::NOT_FOUND),
            (RagError::Corrupt("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                RagError::DimensionMismatch {
                    expected: 3,
                    actual: 4,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn not_found_code() {
        let err = AppError::from(RagError::JobNotFound("abc".into()));
        assert_eq!(err.code, "not_found");
        assert!(err.message.contains("abc"));
    }
}
