//! HTTP API message definitions for Termgate.
//!
//! Request and response bodies for every daemon endpoint, plus the
//! [`StreamEvent`] frames pushed over WebSocket and server-sent events.
//! All bodies are JSON. Timestamps are Unix seconds.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Current API version, reported by the health endpoint.
pub const API_VERSION: u8 = 1;

/// Numeric session identifier, assigned in increasing order.
pub type SessionId = u64;

/// Job identifier (UUID v4 string).
pub type JobId = String;

// ============================================================================
// Session Messages
// ============================================================================

/// Lifecycle state of a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The shell is spawned but has not answered its first command yet.
    Starting,
    /// Idle and accepting commands.
    Ready,
    /// A command (or a resynchronization) is in flight.
    Busy,
    /// The shell process is gone.
    Terminated,
}

impl SessionState {
    /// Returns whether the session can no longer run commands.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

/// Request to create a new named session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Session name. Generated from the shell name when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Shell program. Defaults to the configured shell.
    #[serde(default)]
    pub shell: Option<String>,
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// Assigned session identifier.
    pub session_id: SessionId,
    /// Session name.
    pub name: String,
    /// Process ID of the shell.
    pub pid: Option<u32>,
}

/// Request to execute a command in a specific session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Command text, written to the shell verbatim.
    pub command: String,
    /// Per-call timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Request to execute a command in the default (or a named) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandRequest {
    /// Command text.
    pub command: String,
    /// Session name or numeric id; the default session when omitted. Names
    /// are created on first use.
    #[serde(default)]
    pub session: Option<String>,
    /// Per-call timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Result of one dispatched command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Captured stdout, lines joined with `\n`, marker excluded.
    pub output: String,
    /// Captured stderr, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Exit status of the command, when it completed.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Working directory of the shell after the command.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Whether the wall-clock budget elapsed before completion.
    #[serde(default)]
    pub timed_out: bool,
    /// `"timeout"` when timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Session name.
    pub name: String,
    /// Current state.
    pub state: SessionState,
    /// Shell program.
    pub shell: String,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Last known working directory.
    pub cwd: Option<String>,
    /// Creation time.
    pub created_at: u64,
    /// Number of commands dispatched so far.
    pub commands_run: u64,
}

/// Response listing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListResponse {
    /// All sessions in the registry.
    pub sessions: Vec<SessionSummary>,
}

/// Response to an interrupt request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptResponse {
    /// Session identifier.
    pub session_id: SessionId,
    /// Whether the output stream was resynchronized.
    pub resynced: bool,
    /// State after the interrupt.
    pub state: SessionState,
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the command finished.
    pub timestamp: u64,
    /// Working directory after the command.
    pub cwd: Option<String>,
    /// Command text.
    pub command: String,
    /// Captured stdout.
    pub output: String,
    /// Exit status, when the command completed.
    pub exit_code: Option<i32>,
    /// Whether the command timed out.
    pub timed_out: bool,
}

/// Query parameters for the history endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of entries, newest last.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Response carrying session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Session identifier.
    pub session_id: SessionId,
    /// Entries, oldest first.
    pub entries: Vec<HistoryEntry>,
}

// ============================================================================
// Job Messages
// ============================================================================

/// Whether a job is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The process has not reached EOF yet.
    Running,
    /// Output is final and the exit status recorded.
    Completed,
}

/// Request to start a detached job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobRequest {
    /// Command text, run with `<shell> -c`.
    pub command: String,
}

/// Response to a job start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobResponse {
    /// Assigned job identifier.
    pub job_id: JobId,
}

/// Snapshot of a job's state and output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// Job identifier.
    pub job_id: JobId,
    /// Command text.
    pub command: String,
    /// Running or completed.
    pub status: JobStatus,
    /// Combined stdout/stderr accumulated so far.
    pub output: String,
    /// Exit status once completed. `-1` when the process could not be spawned
    /// or was killed by a signal.
    pub exit_code: Option<i32>,
    /// Start time.
    pub started_at: u64,
    /// Completion time.
    pub finished_at: Option<u64>,
    /// Whether output was capped.
    pub truncated: bool,
}

/// Summary of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job identifier.
    pub job_id: JobId,
    /// Command text.
    pub command: String,
    /// Running or completed.
    pub status: JobStatus,
    /// Exit status once completed.
    pub exit_code: Option<i32>,
    /// Start time.
    pub started_at: u64,
}

/// Response listing jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListResponse {
    /// All jobs still held by the runner.
    pub jobs: Vec<JobSummary>,
}

/// Request to write to a job's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInputRequest {
    /// Text to write; a newline is appended.
    pub input: String,
    /// Close stdin after writing.
    #[serde(default)]
    pub close: bool,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Response to a stop request on a session or job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    /// Identifier that was stopped.
    pub id: String,
    /// True when the target had already been removed.
    pub already_stopped: bool,
    /// Exit status of the stopped process, if known.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Human-readable message.
    pub message: String,
}

impl MessageResponse {
    /// Creates a new acknowledgement.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Liveness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server answers.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// API version.
    pub api_version: u8,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Live session count.
    pub sessions: usize,
    /// Job count.
    pub jobs: usize,
}

// ============================================================================
// Stream Events
// ============================================================================

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Session stdout.
    Stdout,
    /// Session stderr.
    Stderr,
    /// Job output (stdout and stderr interleaved).
    Combined,
}

/// One frame pushed to a streaming client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new output line.
    Output {
        /// Source pipe.
        stream: OutputStream,
        /// Line text without the trailing newline.
        line: String,
    },
    /// The client fell behind and lines were skipped.
    Lagged {
        /// Number of skipped lines.
        skipped: u64,
    },
    /// The session or job ended; no further events follow.
    Ended {
        /// Why the stream closed.
        reason: String,
        /// Exit status, when known.
        exit_code: Option<i32>,
    },
}

impl StreamEvent {
    /// Creates an output event.
    pub fn output(stream: OutputStream, line: impl Into<String>) -> Self {
        StreamEvent::Output {
            stream,
            line: line.into(),
        }
    }

    /// Creates an end-of-stream event.
    pub fn ended(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        StreamEvent::Ended {
            reason: reason.into(),
            exit_code,
        }
    }

    /// Returns whether this is the final event of a stream.
    pub fn is_end(&self) -> bool {
        matches!(self, StreamEvent::Ended { .. })
    }

    /// Serializes the event as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an event from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
