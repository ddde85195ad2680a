//! # Termgate Daemon Library
//!
//! This crate provides the Termgate daemon: an HTTP/WebSocket service that
//! keeps long-lived shell processes on the host and lets authenticated
//! callers drive them remotely.
//!
//! ## Overview
//!
//! - **Persistent Sessions**: named shells whose working directory and
//!   environment survive between commands
//! - **Command Dispatch**: per-command output framing with a random sentinel,
//!   exit codes, timeouts and resynchronization after interrupts
//! - **Detached Jobs**: fire-and-forget commands polled or streamed later
//! - **Streaming**: WebSocket and SSE delivery of incremental output
//! - **Lifecycle**: every spawned child is tracked and reaped on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │            HTTP API (axum) + auth middleware               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │     Job      │  │      Output          │  │
//! │  │   Registry   │  │    Runner    │  │     Streamer         │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │     Child Tracker (process groups, panic hook, reaping)    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serves until a shutdown is requested, then reaps every child.
//!     orchestrator.run_until_stopped().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`api`]: HTTP routes, authentication and error mapping
//! - [`client`]: HTTP client used by the CLI subcommands
//! - [`config`]: Configuration loading and defaults
//! - [`jobs`]: Detached job runner
//! - [`lifecycle`]: Child tracking, signals and restart
//! - [`orchestrator`]: Main daemon coordinator
//! - [`pidfile`]: PID file handling for the CLI
//! - [`session`]: Shell sessions and command dispatch
//! - [`stream`]: Incremental output delivery

pub mod api;
pub mod client;
pub mod config;
pub mod jobs;
pub mod lifecycle;
pub mod orchestrator;
pub mod pidfile;
pub mod session;
pub mod stream;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{Session, SessionError, SessionRegistry};

// Re-export job types for convenience
pub use jobs::{Job, JobError, JobRunner};

// Re-export lifecycle types for convenience
pub use lifecycle::{ChildTracker, ControlHandle};

// Re-export API types for convenience
pub use api::{router, ApiError, AppState};
pub use client::ApiClient;
pub use stream::{EventStream, Streamer};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorState};

/// Current Unix time in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
