//! Session routes.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, ExecuteRequest, ExecuteResponse, HistoryQuery,
    HistoryResponse, InterruptResponse, RunCommandRequest, SessionListResponse, SessionSummary,
    StopResponse,
};
use protocol::SessionId;

use super::{ApiError, AppState};
use crate::session::registry::check_timeout;

fn require_command(command: &str) -> Result<(), ApiError> {
    if command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    Ok(())
}

fn request_timeout(timeout_secs: Option<u64>) -> Result<Option<Duration>, ApiError> {
    let Some(secs) = timeout_secs else {
        return Ok(None);
    };
    let limit = Duration::from_secs(secs);
    check_timeout(limit).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Some(limit))
}

/// `POST /session`. The body is optional.
pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let request: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let session = state.sessions.create(request.name, request.shell).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id(),
            name: session.name().to_string(),
            pid: session.pid(),
        }),
    ))
}

/// `GET /sessions`
pub async fn list(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.sessions.list(),
    })
}

/// `GET /session/:id`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.sessions.resolve(&id)?.summary()))
}

/// `POST /session/:id/execute`
pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = payload?;
    require_command(&request.command)?;
    let timeout = request_timeout(request.timeout_secs)?;

    let session = state.sessions.resolve(&id)?;
    let response = session.execute(&request.command, timeout).await?;
    Ok(Json(response))
}

/// `POST /execute`: runs in the default session, or a named one created on
/// first use.
pub async fn run_command(
    State(state): State<AppState>,
    payload: Result<Json<RunCommandRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = payload?;
    require_command(&request.command)?;
    let timeout = request_timeout(request.timeout_secs)?;

    let name = request.session.unwrap_or_else(|| state.default_session.clone());
    // Numeric keys are ids and never auto-create.
    let session = if name.parse::<SessionId>().is_ok() {
        state.sessions.resolve(&name)?
    } else {
        state.sessions.get_or_create(&name).await?
    };
    let response = session.execute(&request.command, timeout).await?;
    Ok(Json(response))
}

/// `POST /session/:id/interrupt`
pub async fn interrupt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InterruptResponse>, ApiError> {
    let session = state.sessions.resolve(&id)?;
    Ok(Json(session.interrupt().await?))
}

/// `POST /session/:id/stop`. Stopping twice succeeds.
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    Ok(Json(state.sessions.remove(&id).await?))
}

/// `GET /session/:id/history?limit=N`
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query?;
    let session = state.sessions.resolve(&id)?;
    Ok(Json(HistoryResponse {
        session_id: session.id(),
        entries: session.history(query.limit),
    }))
}
