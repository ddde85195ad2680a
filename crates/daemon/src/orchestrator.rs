//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry, job runner and streamer, serves the HTTP API, and tears every
//! child process down again on stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{self, ApiKey, AppState};
use crate::config::Config;
use crate::jobs::JobRunner;
use crate::lifecycle::{self, ChildTracker, ControlHandle};
use crate::session::SessionRegistry;
use crate::stream::Streamer;

/// How long the HTTP server gets to drain after sessions and jobs are gone.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Every spawned shell and job process group.
    tracker: ChildTracker,
    /// Persistent shell sessions.
    sessions: Arc<SessionRegistry>,
    /// Detached jobs.
    jobs: Arc<JobRunner>,
    /// Output streamer shared by the stream routes.
    streamer: Streamer,
    /// Stop and restart requests.
    control: ControlHandle,
    started_at: Instant,
    local_addr: Option<SocketAddr>,
    cleanup_task: Option<JoinHandle<()>>,
    server_task: Option<JoinHandle<Result<()>>>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// The configuration must already carry an API key.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        if config.api_key().is_empty() {
            anyhow::bail!("No API key configured");
        }

        let data_dir = &config.daemon.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create directory: {}", data_dir.display()))?;

        let tracker = ChildTracker::new();
        let sessions = Arc::new(SessionRegistry::new(
            config.session.clone(),
            tracker.clone(),
        ));
        let jobs = Arc::new(JobRunner::new(
            config.job.clone(),
            config.session.default_shell.clone(),
            data_dir.join("jobs"),
            tracker.clone(),
        ));
        let streamer = Streamer::new(Duration::from_millis(config.stream.poll_interval_ms));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            tracker,
            sessions,
            jobs,
            streamer,
            control: ControlHandle::new(),
            started_at: Instant::now(),
            local_addr: None,
            cleanup_task: None,
            server_task: None,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    async fn set_state(&self, state: OrchestratorState) {
        *self.state.write().await = state;
        debug!("Orchestrator state: {:?}", state);
    }

    /// Shared state for the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState {
            sessions: Arc::clone(&self.sessions),
            jobs: Arc::clone(&self.jobs),
            streamer: self.streamer.clone(),
            api_key: ApiKey::new(self.config.api_key()),
            control: self.control.clone(),
            started_at: self.started_at,
            default_session: self.config.session.default_session_name.clone(),
        }
    }

    /// Starts the daemon on the configured listen address.
    pub async fn start(&mut self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.start_with_listener(listener).await
    }

    /// Starts the daemon on an already bound listener.
    pub async fn start_with_listener(&mut self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        info!("Starting daemon orchestrator...");
        lifecycle::install_panic_hook(self.tracker.clone());

        if let Err(e) = self.sessions.ensure_default().await {
            self.set_state(OrchestratorState::Stopped).await;
            return Err(e).context("Failed to start the default session");
        }

        self.cleanup_task = Some(self.sessions.start_cleanup_task(self.control.token()));
        debug!("Started session cleanup task");

        self.local_addr = Some(listener.local_addr().context("Listener has no address")?);
        self.server_task = Some(tokio::spawn(api::serve(listener, self.app_state())));

        self.set_state(OrchestratorState::Running).await;
        info!(addr = ?self.local_addr, "Daemon orchestrator started successfully");
        Ok(())
    }

    /// Waits for a stop or restart request, then stops.
    pub async fn run_until_stopped(&mut self) -> Result<()> {
        self.control.stopped().await;
        self.stop().await
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Every session and job is terminated before the HTTP server is
    /// drained, which also ends any open streams.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping daemon orchestrator...");
        self.control.request_shutdown();

        let sessions = self.sessions.shutdown().await;
        let jobs = self.jobs.shutdown().await;
        info!(sessions = sessions, jobs = jobs, "Child processes terminated");

        if let Some(task) = self.cleanup_task.take() {
            let _ = task.await;
        }

        if let Some(task) = self.server_task.take() {
            match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("HTTP server exited with error: {:#}", e),
                Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
                Err(_) => warn!("HTTP server did not drain in time"),
            }
        }

        let leftover = self.tracker.kill_all();
        if leftover > 0 {
            warn!(count = leftover, "Killed leftover child process groups");
        }

        self.set_state(OrchestratorState::Stopped).await;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Handle for requesting a stop or restart.
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Returns whether the stop was a restart request.
    pub fn restart_requested(&self) -> bool {
        self.control.restart_requested()
    }

    /// Returns the session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Returns the job runner.
    pub fn jobs(&self) -> &Arc<JobRunner> {
        &self.jobs
    }
}

impl Drop for DaemonOrchestrator {
    fn drop(&mut self) {
        // Last resort when stop() never ran.
        let killed = self.tracker.kill_all();
        if killed > 0 {
            warn!(count = killed, "Killed child process groups on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.session.default_shell = "/bin/sh".to_string();
        config.security.api_key = Some("test-key".to_string());
        config
    }

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_requires_api_key() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.security.api_key = None;

        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_state_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        orchestrator
            .start_with_listener(local_listener().await)
            .await
            .unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.local_addr().is_some());

        let second = orchestrator.start_with_listener(local_listener().await).await;
        assert!(second.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        // Stopping twice is fine.
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_creates_default_session() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator
            .start_with_listener(local_listener().await)
            .await
            .unwrap();

        let default = orchestrator.sessions().resolve("default").unwrap();
        assert!(default.is_alive());

        orchestrator.stop().await.unwrap();
        assert!(!default.is_alive());
        assert_eq!(orchestrator.sessions().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_terminates_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator
            .start_with_listener(local_listener().await)
            .await
            .unwrap();

        let id = orchestrator.jobs().start("sleep 30");
        let job = orchestrator.jobs().get(&id).unwrap();
        assert!(job.is_running());

        orchestrator.stop().await.unwrap();
        assert!(!job.is_running());
        assert_eq!(orchestrator.jobs().count(), 0);
    }

    #[tokio::test]
    async fn test_run_until_stopped_returns_on_request() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator
            .start_with_listener(local_listener().await)
            .await
            .unwrap();

        orchestrator.control().request_restart();
        tokio::time::timeout(Duration::from_secs(10), orchestrator.run_until_stopped())
            .await
            .unwrap()
            .unwrap();

        assert!(orchestrator.restart_requested());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}
