//! HTTP API.
//!
//! Thin axum handlers over the session registry, job runner and streamer.
//! Everything except `/` and `/health` sits behind [`auth::require_auth`].

pub mod auth;
pub mod error;
pub mod jobs;
pub mod sessions;
pub mod streaming;
pub mod system;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::jobs::JobRunner;
use crate::lifecycle::ControlHandle;
use crate::session::SessionRegistry;
use crate::stream::Streamer;

pub use auth::ApiKey;
pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub jobs: Arc<JobRunner>,
    pub streamer: Streamer,
    pub api_key: ApiKey,
    pub control: ControlHandle,
    pub started_at: Instant,
    /// Session used by `POST /execute` when the body names none.
    pub default_session: String,
}

/// Builds the full router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/execute", post(sessions::run_command))
        .route("/session", post(sessions::create))
        .route("/sessions", get(sessions::list))
        .route("/session/:id", get(sessions::get))
        .route("/session/:id/execute", post(sessions::execute))
        .route("/session/:id/interrupt", post(sessions::interrupt))
        .route("/session/:id/stop", post(sessions::stop))
        .route("/session/:id/history", get(sessions::history))
        .route("/session/:id/stream", get(streaming::session_socket))
        .route("/job/start", post(jobs::start))
        .route("/jobs", get(jobs::list))
        .route("/job/:id/status", get(jobs::status))
        .route("/job/:id/stop", post(jobs::stop))
        .route("/job/:id/input", post(jobs::input))
        .route("/job/:id/stream", get(streaming::job_socket))
        .route("/job/:id/events", get(streaming::job_events))
        .route("/restart-server", post(system::restart))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/", get(system::root))
        .route("/health", get(system::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API on `listener` until `state.control` requests a stop.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.control.token();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}
