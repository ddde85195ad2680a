//! Job routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use protocol::messages::{
    JobInputRequest, JobListResponse, JobStatusResponse, MessageResponse, StartJobRequest,
    StartJobResponse, StopResponse,
};

use super::{ApiError, AppState};

/// `POST /job/start`. Returns as soon as the job is registered.
pub async fn start(
    State(state): State<AppState>,
    payload: Result<Json<StartJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartJobResponse>), ApiError> {
    let Json(request) = payload?;
    if request.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }

    let job_id = state.jobs.start(&request.command);
    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })))
}

/// `GET /jobs`
pub async fn list(State(state): State<AppState>) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: state.jobs.list(),
    })
}

/// `GET /job/:id/status`
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    Ok(Json(state.jobs.status(&id)?))
}

/// `POST /job/:id/stop`
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    Ok(Json(state.jobs.stop(&id).await?))
}

/// `POST /job/:id/input`
pub async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<JobInputRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(request) = payload?;
    state
        .jobs
        .write_input(&id, &request.input, request.close)
        .await?;
    Ok(Json(MessageResponse::new(if request.close {
        "input written, stdin closed"
    } else {
        "input written"
    })))
}
