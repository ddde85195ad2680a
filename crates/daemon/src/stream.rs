//! Incremental output delivery.
//!
//! The [`Streamer`] attaches a forwarding task to a session or job and
//! hands back an [`EventStream`]. Attaching never takes output away from
//! anyone else: sessions are followed through their broadcast channel, and
//! jobs through a cursor into their append-only buffer. Dropping the
//! stream cancels the forwarding task and leaves the session or job alone.

use std::sync::Arc;
use std::time::Duration;

use protocol::{OutputStream, StreamEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::jobs::Job;
use crate::session::{OutputLine, Session};

/// Events buffered between a forwarding task and a slow client.
const CHANNEL_CAPACITY: usize = 256;

/// Receiving end of an attached stream.
///
/// Ends with exactly one [`StreamEvent::Ended`] unless the stream is
/// dropped first.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Waits for the next event. `None` after the end event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Stops the forwarding task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Attaches event streams to sessions and jobs.
#[derive(Debug, Clone)]
pub struct Streamer {
    poll_interval: Duration,
}

impl Streamer {
    /// Creates a streamer that re-checks job buffers at least every
    /// `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Follows a session's output until its shell exits.
    pub fn session(&self, session: Arc<Session>) -> EventStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        // Subscribe before returning so no line written after attach is missed.
        let output = session.subscribe();
        tokio::spawn(forward_session(session, output, tx, cancel.clone()));
        EventStream { rx, cancel }
    }

    /// Follows a job's output from the first line until it completes.
    pub fn job(&self, job: Arc<Job>) -> EventStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(forward_job(job, tx, cancel.clone(), self.poll_interval));
        EventStream { rx, cancel }
    }
}

async fn forward_session(
    session: Arc<Session>,
    mut output: broadcast::Receiver<OutputLine>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let mut exit = session.exit_watch();
    let session_id = session.id();
    tracing::debug!(session_id = session_id, "Stream attached to session");

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            _ = tx.closed() => break None,
            received = output.recv() => {
                let event = match received {
                    Ok(line) => StreamEvent::output(line.stream, line.text),
                    Err(RecvError::Lagged(skipped)) => StreamEvent::Lagged { skipped },
                    Err(RecvError::Closed) => {
                        break Some(StreamEvent::ended("session closed", session.exit_code()))
                    }
                };
                if tx.send(event).await.is_err() {
                    break None;
                }
            }
            _ = async { exit.wait_for(|code| code.is_some()).await.is_ok() } => {
                // Lines read before the exit are still queued.
                while let Ok(line) = output.try_recv() {
                    if tx.send(StreamEvent::output(line.stream, line.text)).await.is_err() {
                        break;
                    }
                }
                break Some(StreamEvent::ended("session terminated", session.exit_code()));
            }
        }
    };

    if let Some(event) = end {
        let _ = tx.send(event).await;
    }
    tracing::debug!(session_id = session_id, "Stream detached from session");
}

async fn forward_job(
    job: Arc<Job>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let mut changes = job.output().subscribe();
    let mut cursor = 0;
    tracing::debug!(job_id = %job.id(), "Stream attached to job");

    loop {
        let slice = job.output().lines_from(cursor);
        cursor += slice.lines.len();

        for line in slice.lines {
            if tx
                .send(StreamEvent::output(OutputStream::Combined, line))
                .await
                .is_err()
            {
                return;
            }
        }

        if slice.closed {
            let reason = if job.was_stopped() {
                "job stopped"
            } else {
                "job completed"
            };
            let _ = tx.send(StreamEvent::ended(reason, job.exit_code())).await;
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            _ = changes.changed() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    tracing::debug!(job_id = %job.id(), "Stream detached from job");
}
