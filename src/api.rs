//! HTTP control surface.
//!
//! Thin layer over the scheduler (submission) and the status registry
//! (reads). Wire format is JSON with snake_case fields; errors become
//! non-2xx responses carrying a short diagnostic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{DispatchError, Result};
use crate::registry::{StatusRegistry, SupervisorStatus};
use crate::scheduler::{Job, JobState, Scheduler};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<StatusRegistry>,
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub gpu: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatusQuery {
    id: String,
}

#[derive(Deserialize)]
struct JobListQuery {
    state: String,
}

#[derive(Deserialize, Default)]
struct SupervisorListQuery {
    #[serde(default)]
    active: bool,
}

#[derive(Serialize)]
struct SupervisorListResponse {
    supervisors: Vec<SupervisorStatus>,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_only: Option<bool>,
}

#[derive(Serialize)]
struct JobListResponse {
    jobs: Vec<Job>,
    count: usize,
    state: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/jobs/status", get(job_status_handler))
        .route("/supervisors", get(list_supervisors_handler))
        .route("/supervisors/status", get(supervisor_statuses_handler))
        .route("/supervisors/status/:id", get(supervisor_status_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the token is cancelled, then drain gracefully.
pub async fn serve(addr: SocketAddr, state: ApiState, token: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DispatchError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| DispatchError::Internal(format!("HTTP server failed: {e}")))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal_error(e: DispatchError) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(request): Json<SubmitJobRequest>,
) -> Response {
    match state
        .scheduler
        .enqueue(&request.job_type, &request.gpu, request.payload)
        .await
    {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Enqueue failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn job_status_handler(
    State(state): State<ApiState>,
    Query(query): Query<JobStatusQuery>,
) -> Response {
    match state.registry.get_job(&query.id).await {
        Ok(job) => Json(job).into_response(),
        Err(DispatchError::JobNotFound(id)) => {
            error_response(StatusCode::NOT_FOUND, format!("job not found: {id}"))
        }
        Err(e) => internal_error(e),
    }
}

pub async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<JobListQuery>,
) -> Response {
    let job_state: JobState = match query.state.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid job state: {}", query.state),
            )
        }
    };
    match state.registry.get_jobs_by_state(job_state).await {
        Ok(jobs) => Json(JobListResponse {
            count: jobs.len(),
            jobs,
            state: job_state.to_string(),
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn list_supervisors_handler(
    State(state): State<ApiState>,
    Query(query): Query<SupervisorListQuery>,
) -> Response {
    let listing = if query.active {
        state.registry.get_active_supervisors().await
    } else {
        state.registry.get_all_supervisors().await
    };
    match listing {
        Ok(supervisors) => Json(SupervisorListResponse {
            count: supervisors.len(),
            supervisors,
            active_only: Some(query.active),
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn supervisor_statuses_handler(State(state): State<ApiState>) -> Response {
    match state.registry.get_all_supervisors().await {
        Ok(supervisors) => Json(SupervisorListResponse {
            count: supervisors.len(),
            supervisors,
            active_only: None,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn supervisor_status_handler(
    State(state): State<ApiState>,
    Path(consumer_id): Path<String>,
) -> Response {
    match state.registry.get_supervisor(&consumer_id).await {
        Ok(status) => Json(status).into_response(),
        Err(DispatchError::SupervisorNotFound(id)) => error_response(
            StatusCode::NOT_FOUND,
            format!("supervisor not found: {id}"),
        ),
        Err(e) => internal_error(e),
    }
}
