//! Detached background jobs.
//!
//! A job runs `<shell> -c <command>` with stderr folded into stdout. A
//! drain task keeps reading its output into an [`OutputBuffer`] whether or
//! not anyone is polling, so `status` is a cheap snapshot.

pub mod buffer;
pub mod runner;

use thiserror::Error;

pub use buffer::{OutputBuffer, Slice, TRUNCATION_NOTICE};
pub use runner::{Job, JobRunner};

/// Errors that can occur during job operations.
#[derive(Error, Debug)]
pub enum JobError {
    /// No job with this id is held by the runner.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The job's stdin was closed or the job has finished.
    #[error("job input is closed: {0}")]
    InputClosed(String),

    /// I/O error while writing to the job.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
