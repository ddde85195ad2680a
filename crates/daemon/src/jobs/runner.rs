//! Job runner: spawn, poll, feed and stop detached commands.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use protocol::messages::{JobStatusResponse, JobSummary, StopResponse};
use protocol::{JobId, JobStatus};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use super::buffer::OutputBuffer;
use super::JobError;
use crate::config::JobConfig;
use crate::current_timestamp;
use crate::lifecycle::{self, ChildTracker};
use crate::session::process::{complete_utf8_len, read_line_capped, MAX_LINE_BYTES};

/// How long output is still read after the process exited, for
/// descendants that keep the pipe open.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A detached command and its captured output.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    command: String,
    pid: Option<u32>,
    started_at: u64,
    finished_at: AtomicU64,
    output: Arc<OutputBuffer>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit: watch::Sender<Option<i32>>,
    stopped: AtomicBool,
    log_path: Option<PathBuf>,
}

impl Job {
    /// Job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Command text.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Process-group leader, if the job was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Captured output.
    pub fn output(&self) -> &Arc<OutputBuffer> {
        &self.output
    }

    /// Exit code once completed.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Returns whether the job is still running.
    pub fn is_running(&self) -> bool {
        self.exit_code().is_none()
    }

    /// Running or completed.
    pub fn status(&self) -> JobStatus {
        if self.is_running() {
            JobStatus::Running
        } else {
            JobStatus::Completed
        }
    }

    /// Returns whether the job was ended by a stop request.
    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Watch holding the exit code once the job completed.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.subscribe()
    }

    fn finished_at(&self) -> Option<u64> {
        match self.finished_at.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    fn complete(&self, exit_code: i32) {
        self.finished_at
            .store(current_timestamp().max(1), Ordering::SeqCst);
        self.exit.send_replace(Some(exit_code));
        self.output.close();
    }

    /// Full status including the output captured so far.
    pub fn snapshot(&self) -> JobStatusResponse {
        JobStatusResponse {
            job_id: self.id.clone(),
            command: self.command.clone(),
            status: self.status(),
            output: self.output.text(),
            exit_code: self.exit_code(),
            started_at: self.started_at,
            finished_at: self.finished_at(),
            truncated: self.output.is_truncated(),
        }
    }

    /// Summary for listings.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            command: self.command.clone(),
            status: self.status(),
            exit_code: self.exit_code(),
            started_at: self.started_at,
        }
    }

    /// Writes `input` plus a newline to the job's stdin, optionally closing
    /// it afterwards.
    pub async fn write_input(&self, input: &str, close: bool) -> Result<(), JobError> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(JobError::InputClosed(self.id.clone()));
        };
        if !self.is_running() {
            *stdin = None;
            return Err(JobError::InputClosed(self.id.clone()));
        }

        pipe.write_all(input.as_bytes()).await?;
        pipe.write_all(b"\n").await?;
        pipe.flush().await?;

        if close {
            *stdin = None;
            tracing::debug!(job_id = %self.id, "Closed job stdin");
        }
        Ok(())
    }
}

/// Owner of all jobs.
pub struct JobRunner {
    jobs: DashMap<JobId, Arc<Job>>,
    removed: DashSet<JobId>,
    config: JobConfig,
    shell: String,
    log_dir: PathBuf,
    tracker: ChildTracker,
}

impl JobRunner {
    /// Creates a runner that spawns jobs with `shell -c`.
    ///
    /// `log_dir` receives `<id>.log` files when `config.log_to_file` is set.
    pub fn new(config: JobConfig, shell: String, log_dir: PathBuf, tracker: ChildTracker) -> Self {
        Self {
            jobs: DashMap::new(),
            removed: DashSet::new(),
            config,
            shell,
            log_dir,
            tracker,
        }
    }

    /// Starts `command` and returns its id without waiting.
    ///
    /// Spawn failures do not surface here: the job completes immediately
    /// with exit code -1 and the error text as its output.
    pub fn start(&self, command: &str) -> JobId {
        let id = Uuid::new_v4().to_string();
        let output = Arc::new(OutputBuffer::new(self.config.max_output_bytes));
        let (exit, _) = watch::channel(None);
        let log_path = self
            .config
            .log_to_file
            .then(|| self.log_dir.join(format!("{}.log", id)));

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(format!("exec 2>&1\n{}", command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let (child, stdin, stdout, pid) = match spawned {
            Ok(mut child) => {
                let stdin = child.stdin.take();
                let stdout = child.stdout.take();
                let pid = child.id();
                (Some(child), stdin, stdout, pid)
            }
            Err(e) => {
                tracing::warn!(job_id = %id, command = %command, "Failed to spawn job: {}", e);
                output.push_line(format!("failed to spawn job: {}", e));
                (None, None, None, None)
            }
        };

        let job = Arc::new(Job {
            id: id.clone(),
            command: command.to_string(),
            pid,
            started_at: current_timestamp(),
            finished_at: AtomicU64::new(0),
            output,
            stdin: tokio::sync::Mutex::new(stdin),
            exit,
            stopped: AtomicBool::new(false),
            log_path,
        });
        self.jobs.insert(id.clone(), Arc::clone(&job));

        match (child, stdout) {
            (Some(child), Some(stdout)) => {
                if let Some(pid) = pid {
                    self.tracker.register(pid);
                }
                tracing::info!(job_id = %id, pid = ?pid, command = %command, "Started job");
                tokio::spawn(drain(job, child, stdout, self.tracker.clone()));
            }
            _ => job.complete(-1),
        }

        id
    }

    /// Looks up a job.
    pub fn get(&self, id: &str) -> Result<Arc<Job>, JobError> {
        self.jobs
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Status and output so far. Never consumes output.
    pub fn status(&self, id: &str) -> Result<JobStatusResponse, JobError> {
        Ok(self.get(id)?.snapshot())
    }

    /// Writes a line to a job's stdin.
    pub async fn write_input(&self, id: &str, input: &str, close: bool) -> Result<(), JobError> {
        self.get(id)?.write_input(input, close).await
    }

    /// Stops and removes a job.
    ///
    /// A running job gets SIGTERM, then SIGKILL after the grace period. A
    /// completed job is removed without signalling. Stopping a job that
    /// was already removed succeeds with `already_stopped`.
    pub async fn stop(&self, id: &str) -> Result<StopResponse, JobError> {
        let job = match self.get(id) {
            Ok(job) => job,
            Err(_) if self.removed.contains(id) => {
                return Ok(StopResponse {
                    id: id.to_string(),
                    already_stopped: true,
                    exit_code: None,
                })
            }
            Err(e) => return Err(e),
        };

        let exit_code = self.terminate(&job).await;

        self.jobs.remove(id);
        self.removed.insert(id.to_string());
        if let Some(path) = &job.log_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!(job_id = %id, "Could not remove job log: {}", e);
            }
        }

        tracing::info!(job_id = %id, exit_code = ?exit_code, "Stopped job");
        Ok(StopResponse {
            id: id.to_string(),
            already_stopped: false,
            exit_code,
        })
    }

    async fn terminate(&self, job: &Job) -> Option<i32> {
        if !job.is_running() {
            return job.exit_code();
        }
        job.stopped.store(true, Ordering::SeqCst);
        match job.pid {
            Some(pid) => {
                let mut exit = job.exit_watch();
                lifecycle::terminate_group(pid, &mut exit, self.config.stop_grace()).await
            }
            None => job.exit_code(),
        }
    }

    /// Summaries of all jobs, oldest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self.jobs.iter().map(|e| e.value().summary()).collect();
        jobs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    /// Number of jobs held.
    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    /// Number of jobs still running.
    pub fn running_count(&self) -> usize {
        self.jobs.iter().filter(|e| e.value().is_running()).count()
    }

    /// Terminates every running job and forgets all jobs.
    pub async fn shutdown(&self) -> usize {
        let jobs: Vec<Arc<Job>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        let running = jobs.iter().filter(|j| j.is_running()).count();

        futures_util::future::join_all(jobs.iter().map(|job| self.terminate(job))).await;
        for job in &jobs {
            self.jobs.remove(job.id());
            self.removed.insert(job.id().to_string());
        }

        tracing::info!(count = running, "All jobs terminated");
        running
    }
}

/// Reads a job's output until EOF, then records its exit code.
async fn drain(job: Arc<Job>, mut child: Child, stdout: ChildStdout, tracker: ChildTracker) {
    let mut log = match &job.log_path {
        Some(path) => open_log(path).await,
        None => None,
    };

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut exit_code = None;
    let mut drain_until: Option<Instant> = None;

    loop {
        tokio::select! {
            read = read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES) => match read {
                Ok(0) if buf.is_empty() => break,
                Ok(read) => {
                    let cut = if read == 0 || buf.ends_with(b"\n") {
                        buf.len()
                    } else {
                        complete_utf8_len(&buf)
                    };
                    let line = buf[..cut].strip_suffix(b"\n").unwrap_or(&buf[..cut]);
                    let line = String::from_utf8_lossy(line).into_owned();
                    buf.drain(..cut);

                    if let Some(file) = log.as_mut() {
                        let written = file.write_all(line.as_bytes()).await;
                        if written.and(file.write_all(b"\n").await).is_err() {
                            log = None;
                        }
                    }
                    job.output.push_line(line);
                }
                Err(e) => {
                    tracing::debug!(job_id = %job.id, "Job output read failed: {}", e);
                    break;
                }
            },
            status = child.wait(), if exit_code.is_none() => {
                exit_code = Some(match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(_) => -1,
                });
                drain_until = Some(Instant::now() + DRAIN_GRACE);
            }
            _ = tokio::time::sleep_until(drain_until.unwrap_or_else(Instant::now)), if drain_until.is_some() => {
                tracing::debug!(job_id = %job.id, "Output still open after exit, giving up");
                break;
            }
        }
    }

    let code = match exit_code {
        Some(code) => code,
        None => match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        },
    };

    if let Some(pid) = job.pid {
        tracker.unregister(pid);
    }
    if let Some(mut file) = log {
        let _ = file.flush().await;
    }

    tracing::info!(job_id = %job.id, exit_code = code, "Job completed");
    job.complete(code);
}

async fn open_log(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!("Failed to create job log directory {:?}: {}", parent, e);
            return None;
        }
    }
    match File::create(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!("Failed to create job log {:?}: {}", path, e);
            None
        }
    }
}
