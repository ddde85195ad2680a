//! Persistent shell sessions.
//!
//! A session is a long-lived shell driven over plain pipes. Commands are
//! delimited with a per-call sentinel (see [`dispatcher`]), sessions are
//! owned by the [`registry::SessionRegistry`], and every command leaves an
//! entry in the session's [`history::History`].

pub mod dispatcher;
pub mod history;
pub mod process;
pub mod registry;

use thiserror::Error;

pub use dispatcher::{CommandOutcome, Sentinel, SENTINEL_PREFIX};
pub use history::History;
pub use process::{OutputLine, PipeShell, ShellProcess};
pub use registry::{DispatchSettings, Session, SessionRegistry};

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No live or removed session matches the id or name.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Names must be non-empty and not purely numeric.
    #[error("invalid session name: {0:?}")]
    InvalidName(String),

    /// A live session already uses the name.
    #[error("session name already in use: {0}")]
    DuplicateName(String),

    /// A command timeout outside the accepted range.
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    /// A command or resync is in flight on the session.
    #[error("session is busy: {0}")]
    Busy(String),

    /// The configured session limit was reached.
    #[error("session limit reached ({0})")]
    TooManySessions(usize),

    /// The shell could not be started.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// The shell process has exited.
    #[error("session terminated: {0}")]
    Terminated(String),

    /// I/O error on one of the shell's pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns whether the error means the shell is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Terminated(_) | SessionError::Io(_))
    }
}
