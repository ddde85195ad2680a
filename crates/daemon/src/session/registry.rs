//! Session registry.
//!
//! Owns every shell session, hands out numeric ids, and resolves route
//! keys (an id or a name) to sessions. Removed ids and names are
//! remembered so a repeated stop can be told apart from a typo.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use nix::sys::signal::Signal;
use protocol::messages::{
    ExecuteResponse, HistoryEntry, InterruptResponse, SessionSummary, StopResponse,
};
use protocol::{SessionId, SessionState};
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher;
use super::history::History;
use super::process::{OutputLine, PipeShell, ShellProcess};
use super::SessionError;
use crate::config::{SessionConfig, MAX_COMMAND_TIMEOUT_SECS};
use crate::current_timestamp;
use crate::lifecycle::{self, ChildTracker};

/// Accepts non-zero per-command timeouts up to [`MAX_COMMAND_TIMEOUT_SECS`].
pub fn check_timeout(limit: Duration) -> Result<(), SessionError> {
    if limit.is_zero() || limit > Duration::from_secs(MAX_COMMAND_TIMEOUT_SECS) {
        return Err(SessionError::InvalidTimeout(format!(
            "{:?} must be non-zero and at most {}s",
            limit, MAX_COMMAND_TIMEOUT_SECS
        )));
    }
    Ok(())
}

/// Grace period between SIGTERM and SIGKILL when stopping a shell.
const STOP_GRACE: Duration = Duration::from_secs(2);

type ProcessGuard = OwnedMutexGuard<Box<dyn ShellProcess>>;

/// Timing knobs used by a session when dispatching.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Default per-command budget.
    pub command_timeout: Duration,
    /// Budget for resync and cwd queries.
    pub resync_timeout: Duration,
    /// Refresh the working directory after each command.
    pub track_cwd: bool,
}

impl From<&SessionConfig> for DispatchSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            resync_timeout: config.resync_timeout(),
            track_cwd: config.track_cwd,
        }
    }
}

#[derive(Debug)]
struct SessionMeta {
    state: SessionState,
    cwd: Option<String>,
    /// A resync failed; commands are refused until an interrupt succeeds.
    needs_recovery: bool,
    history: History,
}

/// A persistent shell addressable by id and name.
pub struct Session {
    id: SessionId,
    name: String,
    shell: String,
    pid: Option<u32>,
    created_at: u64,
    settings: DispatchSettings,
    process: Arc<tokio::sync::Mutex<Box<dyn ShellProcess>>>,
    output: broadcast::Receiver<OutputLine>,
    exit: watch::Receiver<Option<i32>>,
    meta: Mutex<SessionMeta>,
    commands_run: AtomicU64,
}

impl Session {
    /// Wraps an already running shell process.
    pub fn new(
        id: SessionId,
        name: String,
        shell: String,
        process: Box<dyn ShellProcess>,
        settings: DispatchSettings,
        history_limit: usize,
    ) -> Self {
        Self {
            id,
            name,
            shell,
            pid: process.pid(),
            created_at: current_timestamp(),
            settings,
            output: process.subscribe(),
            exit: process.exit_watch(),
            process: Arc::new(tokio::sync::Mutex::new(process)),
            meta: Mutex::new(SessionMeta {
                state: SessionState::Starting,
                cwd: None,
                needs_recovery: false,
                history: History::new(history_limit),
            }),
            commands_run: AtomicU64::new(0),
        }
    }

    fn meta(&self) -> MutexGuard<'_, SessionMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.meta().state = state;
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process ID of the shell.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    /// Returns whether the shell process is still running.
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit code of the shell once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Current state. A dead process always reports `Terminated`.
    pub fn state(&self) -> SessionState {
        if !self.is_alive() {
            return SessionState::Terminated;
        }
        self.meta().state
    }

    /// Last known working directory.
    pub fn cwd(&self) -> Option<String> {
        self.meta().cwd.clone()
    }

    /// Summary for listings.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            shell: self.shell.clone(),
            pid: self.pid,
            cwd: self.cwd(),
            created_at: self.created_at,
            commands_run: self.commands_run.load(Ordering::SeqCst),
        }
    }

    /// The last `limit` commands, oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        self.meta().history.recent(limit)
    }

    /// Subscribes to the session's output as it is read.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.output.resubscribe()
    }

    /// Watch holding the shell's exit code once it has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    /// Runs a command and waits for its sentinel or the timeout.
    ///
    /// Fails fast with [`SessionError::Busy`] when another command or a
    /// resync holds the shell. A timed-out command returns its partial
    /// output; the shell is resynchronized in the background and stays
    /// busy until that finishes.
    pub async fn execute(
        self: &Arc<Self>,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Terminated(self.label()));
        }
        if let Some(limit) = timeout {
            check_timeout(limit)?;
        }

        let mut guard = Arc::clone(&self.process)
            .try_lock_owned()
            .map_err(|_| SessionError::Busy(self.label()))?;

        if self.meta().needs_recovery {
            return Err(SessionError::Busy(format!(
                "{} needs an interrupt to recover",
                self.label()
            )));
        }

        self.set_state(SessionState::Busy);
        let limit = timeout.unwrap_or(self.settings.command_timeout);

        let outcome = match dispatcher::run_command(&mut **guard, command, limit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let cwd = if outcome.timed_out {
            self.cwd()
        } else {
            self.refresh_cwd(&mut guard).await
        };

        self.commands_run.fetch_add(1, Ordering::SeqCst);
        let response = ExecuteResponse {
            output: outcome.output(),
            stderr: outcome.stderr_text(),
            exit_code: outcome.exit_code,
            cwd: cwd.clone(),
            timed_out: outcome.timed_out,
            error: outcome.timed_out.then(|| "timeout".to_string()),
        };

        tracing::info!(
            target: "termgate::commands",
            session_id = self.id,
            cwd = cwd.as_deref().unwrap_or("?"),
            exit_code = ?outcome.exit_code,
            output_len = response.output.len(),
            timed_out = outcome.timed_out,
            "{}",
            command
        );

        self.meta().history.push(HistoryEntry {
            timestamp: current_timestamp(),
            cwd,
            command: command.to_string(),
            output: response.output.clone(),
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
        });

        if outcome.timed_out {
            tracing::warn!(session_id = self.id, "Command timed out, resynchronizing");
            let session = Arc::clone(self);
            tokio::spawn(async move { session.resync_in_background(guard).await });
        } else {
            self.set_state(SessionState::Ready);
        }

        Ok(response)
    }

    /// Waits for a new shell to answer its first sentinel, recording the
    /// starting directory, then marks the session ready.
    async fn start(&self) -> Result<(), SessionError> {
        let mut guard = Arc::clone(&self.process).lock_owned().await;
        match dispatcher::query_cwd(&mut **guard, self.settings.resync_timeout).await {
            Ok(cwd) => {
                let mut meta = self.meta();
                meta.cwd = cwd;
                meta.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn refresh_cwd(&self, guard: &mut ProcessGuard) -> Option<String> {
        if !self.settings.track_cwd {
            return self.cwd();
        }
        match dispatcher::query_cwd(&mut ***guard, self.settings.resync_timeout).await {
            Ok(Some(cwd)) => {
                self.meta().cwd = Some(cwd.clone());
                Some(cwd)
            }
            Ok(None) => self.cwd(),
            Err(e) => {
                self.fail(&e);
                self.cwd()
            }
        }
    }

    async fn resync_in_background(self: Arc<Self>, mut guard: ProcessGuard) {
        match dispatcher::resync(&mut **guard, self.settings.resync_timeout).await {
            Ok(true) => {
                let mut meta = self.meta();
                meta.needs_recovery = false;
                meta.state = SessionState::Ready;
                tracing::info!(session_id = self.id, "Session resynchronized");
            }
            Ok(false) => {
                self.meta().needs_recovery = true;
                tracing::warn!(
                    session_id = self.id,
                    "Resync timed out; session stays busy until interrupted"
                );
            }
            Err(e) => {
                tracing::warn!(session_id = self.id, "Resync failed: {}", e);
                self.fail(&e);
            }
        }
    }

    fn fail(&self, error: &SessionError) {
        if error.is_fatal() {
            tracing::warn!(session_id = self.id, "Session terminated: {}", error);
            self.set_state(SessionState::Terminated);
        } else {
            self.set_state(SessionState::Ready);
        }
    }

    /// Ctrl-C equivalent.
    ///
    /// An idle or stuck session is interrupted and resynchronized. While a
    /// command is in flight the signal is sent directly and that command
    /// completes on its own.
    pub async fn interrupt(self: &Arc<Self>) -> Result<InterruptResponse, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Terminated(self.label()));
        }

        let resynced = match Arc::clone(&self.process).try_lock_owned() {
            Ok(mut guard) => {
                self.set_state(SessionState::Busy);
                match dispatcher::resync(&mut **guard, self.settings.resync_timeout).await {
                    Ok(synced) => {
                        let mut meta = self.meta();
                        meta.needs_recovery = !synced;
                        if synced {
                            meta.state = SessionState::Ready;
                        }
                        synced
                    }
                    Err(e) => {
                        self.fail(&e);
                        return Err(e);
                    }
                }
            }
            Err(_) => {
                if let Some(pid) = self.pid {
                    lifecycle::signal_group(pid, Signal::SIGINT).map_err(std::io::Error::from)?;
                }
                false
            }
        };

        tracing::info!(session_id = self.id, resynced = resynced, "Session interrupted");
        Ok(InterruptResponse {
            session_id: self.id,
            resynced,
            state: self.state(),
        })
    }

    /// Terminates the shell. Does not wait for an in-flight command.
    pub async fn terminate(&self, grace: Duration) -> Option<i32> {
        let code = match Arc::clone(&self.process).try_lock_owned() {
            Ok(mut guard) => guard.terminate(grace).await,
            Err(_) => match self.pid {
                Some(pid) => lifecycle::terminate_group(pid, &mut self.exit.clone(), grace).await,
                None => self.exit_code(),
            },
        };
        self.set_state(SessionState::Terminated);
        code
    }
}

/// Owner of all sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    removed_ids: DashSet<SessionId>,
    removed_names: DashSet<String>,
    next_id: AtomicU64,
    create_lock: tokio::sync::Mutex<()>,
    config: SessionConfig,
    tracker: ChildTracker,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: SessionConfig, tracker: ChildTracker) -> Self {
        Self {
            sessions: DashMap::new(),
            removed_ids: DashSet::new(),
            removed_names: DashSet::new(),
            next_id: AtomicU64::new(1),
            create_lock: tokio::sync::Mutex::new(()),
            config,
            tracker,
        }
    }

    /// Spawns a new session.
    ///
    /// A dead session holding the same name is replaced.
    pub async fn create(
        &self,
        name: Option<String>,
        shell: Option<String>,
    ) -> Result<Arc<Session>, SessionError> {
        let _guard = self.create_lock.lock().await;

        if let Some(name) = &name {
            if name.trim().is_empty() || name.parse::<SessionId>().is_ok() {
                return Err(SessionError::InvalidName(name.clone()));
            }
            if let Some(existing) = self.find_by_name(name) {
                if existing.is_alive() {
                    return Err(SessionError::DuplicateName(name.clone()));
                }
                self.sessions.remove(&existing.id());
                tracing::debug!(session_id = existing.id(), "Replacing dead session");
            }
        }

        if self.live_count() >= self.config.max_sessions {
            return Err(SessionError::TooManySessions(self.config.max_sessions));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shell = shell.unwrap_or_else(|| self.config.default_shell.clone());
        let name = name.unwrap_or_else(|| format!("{}-{}", shell_basename(&shell), id));

        let process = PipeShell::spawn(&shell, &self.tracker).await?;
        let session = Arc::new(Session::new(
            id,
            name.clone(),
            shell.clone(),
            Box::new(process),
            DispatchSettings::from(&self.config),
            self.config.history_limit,
        ));

        self.sessions.insert(id, Arc::clone(&session));
        self.removed_names.remove(&name);

        if let Err(e) = session.start().await {
            self.sessions.remove(&id);
            return Err(SessionError::SpawnFailed(format!("{}: {}", shell, e)));
        }

        tracing::info!(
            session_id = id,
            name = %name,
            shell = %shell,
            pid = ?session.pid(),
            "Created new session"
        );

        Ok(session)
    }

    /// Returns the live session called `name`, creating it if needed.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.find_by_name(name).filter(|s| s.is_alive()) {
            return Ok(session);
        }
        match self.create(Some(name.to_string()), None).await {
            Err(SessionError::DuplicateName(_)) => self
                .find_by_name(name)
                .ok_or_else(|| SessionError::NotFound(name.to_string())),
            other => other,
        }
    }

    /// Creates the configured default session if it is not running.
    pub async fn ensure_default(&self) -> Result<Arc<Session>, SessionError> {
        let name = self.config.default_session_name.clone();
        self.get_or_create(&name).await
    }

    /// Resolves a route key: a numeric id, else a name.
    pub fn resolve(&self, key: &str) -> Result<Arc<Session>, SessionError> {
        if let Ok(id) = key.parse::<SessionId>() {
            if let Some(session) = self.sessions.get(&id) {
                return Ok(Arc::clone(session.value()));
            }
        }
        self.find_by_name(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }

    fn find_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().name() == name)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn was_removed(&self, key: &str) -> bool {
        match key.parse::<SessionId>() {
            Ok(id) => self.removed_ids.contains(&id),
            Err(_) => self.removed_names.contains(key),
        }
    }

    fn forget(&self, session: &Session) {
        self.sessions.remove(&session.id());
        self.removed_ids.insert(session.id());
        self.removed_names.insert(session.name().to_string());
    }

    /// Stops and removes a session.
    ///
    /// Stopping a session that was already removed succeeds with
    /// `already_stopped`; a key that never named a session is `NotFound`.
    pub async fn remove(&self, key: &str) -> Result<StopResponse, SessionError> {
        let session = match self.resolve(key) {
            Ok(session) => session,
            Err(_) if self.was_removed(key) => {
                return Ok(StopResponse {
                    id: key.to_string(),
                    already_stopped: true,
                    exit_code: None,
                })
            }
            Err(e) => return Err(e),
        };

        self.forget(&session);
        let exit_code = session.terminate(STOP_GRACE).await;

        tracing::info!(session_id = session.id(), exit_code = ?exit_code, "Stopped session");
        Ok(StopResponse {
            id: session.id().to_string(),
            already_stopped: false,
            exit_code,
        })
    }

    /// Summaries of all sessions, ordered by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.sessions.iter().map(|e| e.value().summary()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Number of sessions held, dead or alive.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions whose shell is running.
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().is_alive()).count()
    }

    /// Removes sessions whose shell has exited.
    pub fn cleanup(&self) -> usize {
        let dead: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| !e.value().is_alive())
            .map(|e| Arc::clone(e.value()))
            .collect();

        for session in &dead {
            self.forget(session);
            tracing::info!(session_id = session.id(), "Cleaned up terminated session");
        }
        dead.len()
    }

    /// Starts a background task that periodically cleans up dead sessions.
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        registry.cleanup();
                    }
                }
            }
        })
    }

    /// Terminates every session. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in &sessions {
            self.forget(session);
        }

        futures_util::future::join_all(sessions.iter().map(|s| s.terminate(STOP_GRACE))).await;
        tracing::info!(count = sessions.len(), "All sessions terminated");
        sessions.len()
    }
}

fn shell_basename(shell: &str) -> &str {
    Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            default_shell: "/bin/sh".to_string(),
            max_sessions: 3,
            command_timeout_secs: 5,
            resync_timeout_secs: 3,
            history_limit: 10,
            ..Default::default()
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(test_config(), ChildTracker::new())
    }

    async fn wait_for_state(session: &Session, state: SessionState) {
        for _ in 0..100 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session never reached {:?}, is {:?}", state, session.state());
    }

    #[test]
    fn test_shell_basename() {
        assert_eq!(shell_basename("/bin/bash"), "bash");
        assert_eq!(shell_basename("zsh"), "zsh");
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_names() {
        let registry = registry();

        let first = registry.create(None, None).await.unwrap();
        let second = registry.create(Some("build".into()), None).await.unwrap();

        assert_eq!(first.id(), 1);
        assert_eq!(first.name(), "sh-1");
        assert_eq!(second.id(), 2);
        assert_eq!(second.name(), "build");
        assert!(first.pid().is_some());
        assert_eq!(first.state(), SessionState::Ready);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names() {
        let registry = registry();
        registry.create(Some("s1".into()), None).await.unwrap();

        let result = registry.create(Some("s1".into()), None).await;
        assert!(matches!(result, Err(SessionError::DuplicateName(_))));

        let result = registry.create(Some("42".into()), None).await;
        assert!(matches!(result, Err(SessionError::InvalidName(_))));

        let result = registry.create(Some(" ".into()), None).await;
        assert!(matches!(result, Err(SessionError::InvalidName(_))));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_limit() {
        let registry = registry();
        for _ in 0..3 {
            registry.create(None, None).await.unwrap();
        }

        let result = registry.create(None, None).await;
        assert!(matches!(result, Err(SessionError::TooManySessions(3))));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let registry = registry();
        let result = registry
            .create(None, Some("/nonexistent/shell".into()))
            .await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_shell_that_never_answers_fails_to_start() {
        let registry = registry();
        let result = registry.create(None, Some("/bin/true".into())).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_start_records_initial_cwd() {
        let registry = registry();
        let session = registry.create(None, None).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        let cwd = std::fs::canonicalize(session.cwd().unwrap()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(std::env::current_dir().unwrap()).unwrap());
        assert!(session.history(None).is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_by_id_and_name() {
        let registry = registry();
        let session = registry.create(Some("work".into()), None).await.unwrap();

        assert_eq!(registry.resolve("1").unwrap().id(), session.id());
        assert_eq!(registry.resolve("work").unwrap().id(), session.id());
        assert!(matches!(
            registry.resolve("nope"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(registry.resolve("99"), Err(SessionError::NotFound(_))));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_tracks_cwd_and_history() {
        let registry = registry();
        let session = registry.create(Some("s1".into()), None).await.unwrap();

        let response = session.execute("echo hello", None).await.unwrap();
        assert_eq!(response.output, "hello");
        assert_eq!(response.exit_code, Some(0));
        assert!(!response.timed_out);
        assert!(response.error.is_none());

        let response = session.execute("cd /tmp", None).await.unwrap();
        assert_eq!(response.cwd.as_deref(), Some("/tmp"));

        let response = session.execute("pwd", None).await.unwrap();
        assert_eq!(response.output, "/tmp");
        assert_eq!(session.cwd().as_deref(), Some("/tmp"));

        let history = session.history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].command, "echo hello");
        assert_eq!(history[0].output, "hello");
        assert_eq!(history[2].cwd.as_deref(), Some("/tmp"));
        assert_eq!(session.history(Some(1))[0].command, "pwd");
        assert_eq!(session.summary().commands_run, 3);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_execute_is_busy() {
        let registry = registry();
        let session = registry.create(None, None).await.unwrap();

        let running = Arc::clone(&session);
        let first = tokio::spawn(async move { running.execute("sleep 1; echo done", None).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(session.state(), SessionState::Busy);
        let second = session.execute("echo nope", None).await;
        assert!(matches!(second, Err(SessionError::Busy(_))));

        let response = first.await.unwrap().unwrap();
        assert_eq!(response.output, "done");
        assert_eq!(session.state(), SessionState::Ready);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_and_resyncs() {
        let registry = registry();
        let session = registry.create(None, None).await.unwrap();

        let started = std::time::Instant::now();
        let response = session
            .execute("sleep 9999", Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(response.timed_out);
        assert_eq!(response.error.as_deref(), Some("timeout"));
        assert_eq!(response.output, "");

        wait_for_state(&session, SessionState::Ready).await;

        let response = session.execute("echo recovered", None).await.unwrap();
        assert_eq!(response.output, "recovered");
        assert!(session.history(None)[0].timed_out);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_is_rejected() {
        let registry = registry();
        let session = registry.create(Some("target".into()), None).await.unwrap();
        let bystander = registry.create(Some("bystander".into()), None).await.unwrap();

        for limit in [Duration::ZERO, Duration::from_secs(u64::MAX)] {
            let result = session.execute("echo hi", Some(limit)).await;
            assert!(matches!(result, Err(SessionError::InvalidTimeout(_))));
        }

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.execute("echo ok", None).await.unwrap().output, "ok");
        assert_eq!(bystander.execute("echo alive", None).await.unwrap().output, "alive");

        registry.shutdown().await;
    }

    #[test]
    fn test_check_timeout_bounds() {
        assert!(check_timeout(Duration::from_millis(1)).is_ok());
        assert!(check_timeout(Duration::from_secs(MAX_COMMAND_TIMEOUT_SECS)).is_ok());
        assert!(check_timeout(Duration::ZERO).is_err());
        assert!(check_timeout(Duration::from_secs(MAX_COMMAND_TIMEOUT_SECS + 1)).is_err());
    }

    #[tokio::test]
    async fn test_interrupt_while_running() {
        let registry = registry();
        let session = registry.create(None, None).await.unwrap();

        let running = Arc::clone(&session);
        let task = tokio::spawn(async move { running.execute("sleep 30", None).await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let interrupted = session.interrupt().await.unwrap();
        assert!(!interrupted.resynced);

        let response = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!response.timed_out);
        assert_ne!(response.exit_code, Some(0));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_interrupt_idle_resyncs() {
        let registry = registry();
        let session = registry.create(None, None).await.unwrap();

        let response = session.interrupt().await.unwrap();
        assert!(response.resynced);
        assert_eq!(response.state, SessionState::Ready);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = registry();
        registry.create(Some("s1".into()), None).await.unwrap();

        let stopped = registry.remove("s1").await.unwrap();
        assert!(!stopped.already_stopped);
        assert_eq!(stopped.id, "1");

        let again = registry.remove("s1").await.unwrap();
        assert!(again.already_stopped);
        let by_id = registry.remove("1").await.unwrap();
        assert!(by_id.already_stopped);

        assert!(matches!(
            registry.remove("never-existed").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(registry.resolve("s1"), Err(SessionError::NotFound(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_name_reusable_after_stop() {
        let registry = registry();
        registry.create(Some("s1".into()), None).await.unwrap();
        registry.remove("s1").await.unwrap();

        let session = registry.create(Some("s1".into()), None).await.unwrap();
        assert_eq!(session.id(), 2);
        assert_eq!(registry.resolve("s1").unwrap().id(), 2);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_or_create_replaces_dead_default() {
        let registry = registry();

        let first = registry.ensure_default().await.unwrap();
        assert_eq!(first.name(), "default");
        assert_eq!(registry.ensure_default().await.unwrap().id(), first.id());

        let result = first.execute("exit 0", None).await;
        assert!(matches!(result, Err(SessionError::Terminated(_))));
        wait_for_state(&first, SessionState::Terminated).await;

        let second = registry.ensure_default().await.unwrap();
        assert_ne!(second.id(), first.id());
        assert!(second.is_alive());
        assert_eq!(registry.count(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_removes_dead_sessions() {
        let registry = registry();
        let session = registry.create(Some("short".into()), None).await.unwrap();
        registry.create(None, None).await.unwrap();

        let _ = session.execute("exit 3", None).await;
        wait_for_state(&session, SessionState::Terminated).await;

        assert_eq!(registry.cleanup(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.remove("short").await.unwrap().already_stopped);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let tracker = ChildTracker::new();
        let registry = SessionRegistry::new(test_config(), tracker.clone());
        let a = registry.create(None, None).await.unwrap();
        let b = registry.create(None, None).await.unwrap();
        assert_eq!(tracker.len(), 2);

        assert_eq!(registry.shutdown().await, 2);
        assert!(!a.is_alive());
        assert!(!b.is_alive());
        assert!(tracker.is_empty());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_list_ordered() {
        let registry = registry();
        registry.create(Some("b".into()), None).await.unwrap();
        registry.create(Some("a".into()), None).await.unwrap();

        let names: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "a"]);

        registry.shutdown().await;
    }
}
