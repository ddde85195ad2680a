//! PID file handling.
//!
//! The running server writes its PID to `<data_dir>/termgate.pid`. The CLI
//! reads it to refuse a second `start` and to signal the server on `stop`.
//! A file naming a process that no longer exists is stale and is removed
//! whenever it is read.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

const PID_FILE_NAME: &str = "termgate.pid";

/// Returns the PID file path inside `data_dir`.
pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Returns the PID of the running server, if any.
pub fn running_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            tracing::debug!(path = %path.display(), "Removing stale PID file");
            let _ = fs::remove_file(path);
            None
        }
    }
}

/// Returns whether a process with this PID exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence. EPERM means it exists under
    // another user.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// PID file owned by the running server; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current PID to `path`.
    ///
    /// Fails when another live server already holds the file. A restart
    /// re-execs in place with the same PID, so a file naming this process is
    /// taken over.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let own = std::process::id();

        if let Some(pid) = running_pid(&path) {
            if pid != own {
                bail!("termgate is already running (PID {})", pid);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&path, format!("{}\n", own))
            .with_context(|| format!("Failed to write PID file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), pid = own, "Wrote PID file");
        Ok(Self { path })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "Failed to remove PID file: {}", e),
        }
    }
}
