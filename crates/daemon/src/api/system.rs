//! Health, root and restart routes.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use protocol::messages::{HealthResponse, MessageResponse};
use protocol::API_VERSION;

use super::AppState;

/// Delay before a requested restart, so the response reaches the caller.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// `GET /`
pub async fn root() -> Json<MessageResponse> {
    Json(MessageResponse::new(format!(
        "termgate {} remote shell API",
        env!("CARGO_PKG_VERSION")
    )))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions: state.sessions.live_count(),
        jobs: state.jobs.count(),
    })
}

/// `POST /restart-server`
///
/// Answers immediately; the orchestrator then runs the normal cleanup and
/// re-executes the binary.
pub async fn restart(State(state): State<AppState>) -> (StatusCode, Json<MessageResponse>) {
    tracing::warn!("Restart requested over the API");
    let control = state.control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_DELAY).await;
        control.request_restart();
    });
    (
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("server restarting")),
    )
}
