//! Child process bookkeeping and last-resort cleanup.
//!
//! Every shell and job is spawned as the leader of its own process group and
//! registered with a [`ChildTracker`]. Normal shutdown goes through the
//! session registry and the job runner, which signal each group and wait for
//! it. The tracker backs the paths where that cannot happen: a panic, or the
//! orchestrator being dropped without a clean stop.
//!
//! If the server itself is killed with SIGKILL nothing here runs. Children
//! spawned with `kill_on_drop` are not reaped in that case either; they are
//! left to the init process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Set of process-group leaders currently owned by the daemon.
#[derive(Debug, Clone, Default)]
pub struct ChildTracker {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ChildTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn pids(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a spawned process-group leader.
    pub fn register(&self, pid: u32) {
        self.pids().insert(pid);
    }

    /// Forgets a process that has been reaped.
    pub fn unregister(&self, pid: u32) {
        self.pids().remove(&pid);
    }

    /// Returns the tracked pids.
    pub fn snapshot(&self) -> Vec<u32> {
        self.pids().iter().copied().collect()
    }

    /// Returns the number of tracked processes.
    pub fn len(&self) -> usize {
        self.pids().len()
    }

    /// Returns whether no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.pids().is_empty()
    }

    /// Sends SIGKILL to every tracked process group and clears the set.
    ///
    /// Synchronous so it can run from a panic hook or `Drop`.
    pub fn kill_all(&self) -> usize {
        let pids: Vec<u32> = self.pids().drain().collect();
        let mut killed = 0;
        for pid in pids {
            if signal_group(pid, Signal::SIGKILL).is_ok() {
                killed += 1;
            }
        }
        killed
    }
}

/// Sends `signal` to the process group led by `pid`.
///
/// A group that no longer exists counts as success.
pub fn signal_group(pid: u32, signal: Signal) -> Result<(), Errno> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(Errno::EINVAL);
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Terminates a process group: SIGTERM, wait up to `grace` for the exit
/// watch to report an exit code, then SIGKILL.
///
/// Returns the exit code if it became known.
pub async fn terminate_group(
    pid: u32,
    exit: &mut watch::Receiver<Option<i32>>,
    grace: Duration,
) -> Option<i32> {
    if let Some(code) = *exit.borrow() {
        return Some(code);
    }

    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        tracing::warn!(pid = pid, "Failed to send SIGTERM: {}", e);
    }
    if let Some(code) = wait_exit(exit, grace).await {
        return Some(code);
    }

    tracing::debug!(pid = pid, "Process group ignored SIGTERM, sending SIGKILL");
    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
        tracing::warn!(pid = pid, "Failed to send SIGKILL: {}", e);
    }
    wait_exit(exit, Duration::from_secs(1)).await
}

async fn wait_exit(exit: &mut watch::Receiver<Option<i32>>, limit: Duration) -> Option<i32> {
    let waited = tokio::time::timeout(limit, exit.wait_for(|code| code.is_some()))
        .await
        .map(|r| r.map(|code| *code));
    match waited {
        Ok(Ok(code)) => code,
        _ => *exit.borrow(),
    }
}

/// Whether a panic on the named thread takes the whole process down.
///
/// Panics on runtime worker threads are caught by tokio and only end the
/// task, so children must survive them.
fn panic_is_fatal(thread_name: Option<&str>) -> bool {
    cfg!(panic = "abort") || thread_name == Some("main")
}

/// Installs a panic hook that kills every tracked process group when a panic
/// is about to end the process, then runs the previous hook.
pub fn install_panic_hook(tracker: ChildTracker) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if panic_is_fatal(std::thread::current().name()) {
            let killed = tracker.kill_all();
            if killed > 0 {
                eprintln!("termgate: killed {} child process group(s) after panic", killed);
            }
        }
        previous(info);
    }));
}

/// Handle used by the API to ask the server loop to stop or restart.
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    shutdown: CancellationToken,
    restart: Arc<AtomicBool>,
}

impl ControlHandle {
    /// Creates a new handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a normal shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Requests a shutdown followed by a re-exec of the server.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    /// Returns whether a restart was requested.
    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Returns the token cancelled when the server should stop.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Completes once a stop or restart has been requested.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
    }
}

/// Replaces the current process with a fresh copy of the same binary and
/// arguments. Only returns on failure.
pub fn reexec() -> anyhow::Error {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return anyhow::anyhow!("cannot resolve current executable: {}", e),
    };
    let args: Vec<_> = std::env::args_os().skip(1).collect();

    tracing::info!(exe = %exe.display(), "Re-executing server");
    let err = std::process::Command::new(&exe).args(&args).exec();
    anyhow::anyhow!("failed to re-exec {}: {}", exe.display(), err)
}
