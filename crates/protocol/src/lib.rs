//! # Termgate Protocol Library
//!
//! Wire types for the Termgate remote-shell HTTP API. The daemon serializes
//! these as JSON response bodies and the CLI client deserializes them, so
//! both sides agree on a single definition.
//!
//! ## Overview
//!
//! - **Session messages**: create, execute, interrupt, stop and list
//!   persistent shell sessions
//! - **Job messages**: start, poll, feed and stop detached background jobs
//! - **Stream events**: incremental output pushed over WebSocket or SSE
//! - **Errors**: machine-readable error codes and the JSON error body
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{ExecuteRequest, StreamEvent, OutputStream};
//!
//! let request: ExecuteRequest = serde_json::from_str(r#"{"command":"echo hi"}"#).unwrap();
//! assert_eq!(request.command, "echo hi");
//!
//! let event = StreamEvent::output(OutputStream::Stdout, "hi");
//! let json = event.to_json().unwrap();
//! assert!(json.contains("\"type\":\"output\""));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request/response bodies and stream events
//! - [`error`]: Error codes and error types

pub mod error;
pub mod messages;

pub use error::{ErrorBody, ErrorCode, ProtocolError, Result};
pub use messages::{
    JobId, JobStatus, OutputStream, SessionId, SessionState, StreamEvent, API_VERSION,
};
