//! HTTP control surface.
//!
//! ```text
//! POST /api/start        {"job": "<id>"}?   start / restart from a job
//! POST /api/stop         {"job": "<id>"}?   stop one job / stop all
//! GET  /api/status                          job records in canonical order
//! GET  /api/events                          SSE status feed
//! GET  /api/logs/:job                       per-job log text
//! GET  /health
//! ```

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::control::{normalize_job_id, ControlSurface};
use crate::error::OrchestratorError;
use crate::job::JobRecord;
use crate::scheduler::StartOutcome;

#[derive(Debug, Default, Deserialize)]
pub struct JobRequest {
    pub job: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum StartResponse {
    Started {
        epoch: u64,
        admitted: Vec<String>,
        queued: Vec<String>,
    },
    Conflict {
        job: String,
    },
}

pub fn router(control: ControlSurface) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/start", post(start_handler))
        .route("/api/stop", post(stop_handler))
        .route("/api/status", get(status_handler))
        .route("/api/events", get(events_handler))
        .route("/api/logs/:job", get(log_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

/// An empty body is the same as `{}`.
fn parse_request(body: &str) -> Result<JobRequest, ApiError> {
    if body.trim().is_empty() {
        return Ok(JobRequest::default());
    }
    serde_json::from_str(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn start_handler(
    State(control): State<ControlSurface>,
    body: String,
) -> Result<Response, ApiError> {
    let request = parse_request(&body)?;
    let job = request.job.as_deref().map(normalize_job_id);

    let outcome = control.start(job).await?;
    let response = match outcome {
        StartOutcome::Started {
            epoch,
            admitted,
            queued,
        } => (
            StatusCode::OK,
            Json(StartResponse::Started {
                epoch,
                admitted: admitted.into_iter().map(|id| id.to_string()).collect(),
                queued: queued.into_iter().map(|id| id.to_string()).collect(),
            }),
        ),
        StartOutcome::Conflict(id) => (
            StatusCode::CONFLICT,
            Json(StartResponse::Conflict {
                job: id.to_string(),
            }),
        ),
    };
    Ok(response.into_response())
}

async fn stop_handler(
    State(control): State<ControlSurface>,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = parse_request(&body)?;
    let job = request.job.as_deref().map(normalize_job_id);

    let stopped = control.stop(job).await?;
    Ok(Json(json!({
        "status": "stopped",
        "stopped": stopped,
    })))
}

async fn status_handler(State(control): State<ControlSurface>) -> Json<Vec<JobRecord>> {
    Json(control.status())
}

async fn log_handler(
    State(control): State<ControlSurface>,
    Path(job): Path<String>,
) -> Result<Response, ApiError> {
    let id = normalize_job_id(&job);
    match control.read_log(&id).await? {
        Some(text) => Ok(text.into_response()),
        None => Ok((StatusCode::NOT_FOUND, "no log yet").into_response()),
    }
}

/// SSE handler: one event per fleet state change.
async fn events_handler(State(control): State<ControlSurface>) -> impl IntoResponse {
    let rx = control.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok::<_, Infallible>(
                Event::default().event(event.name()).data(data),
            ))
        }
        Err(BroadcastStreamRecvError::Lagged(_)) => {
            Some(Ok(Event::default().event("lagged").data("{}")))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health_handler() -> &'static str {
    "ok"
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError::Orchestrator(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found", e.to_string()),
                e if e.is_conflict() => (StatusCode::CONFLICT, "conflict", e.to_string()),
                OrchestratorError::NotRestartable(_) => {
                    (StatusCode::CONFLICT, "not_restartable", e.to_string())
                }
                other => {
                    error!(error = %other, "control request failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, "error", other.to_string())
                }
            },
        };
        (status, Json(json!({ "status": label, "message": message }))).into_response()
    }
}
