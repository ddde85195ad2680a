//! Shell process backends.
//!
//! [`ShellProcess`] is the capability set the dispatcher needs from a shell.
//! [`PipeShell`] is the only backend: the shell runs with piped
//! stdin/stdout/stderr as the leader of its own process group. A pty-based
//! backend would report terminal semantics more faithfully but is not
//! provided.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use protocol::OutputStream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, watch};

use super::dispatcher::{self, SENTINEL_LEN, SENTINEL_PREFIX};
use super::SessionError;
use crate::lifecycle::{self, ChildTracker};

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 1024;

/// Longest line held in memory. Longer lines are delivered in pieces.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Installed on start: SIGINT to the process group ends the foreground
/// command but leaves the shell running.
const SHELL_PRELUDE: &str = "trap ':' INT\n";

/// One line read from the shell, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Pipe the line came from.
    pub stream: OutputStream,
    /// Line text.
    pub text: String,
}

impl OutputLine {
    /// Creates a new output line.
    pub fn new(stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

/// Capabilities of a shell driven by the dispatcher.
#[async_trait]
pub trait ShellProcess: Send + Sync {
    /// Process ID of the shell, if it is known.
    fn pid(&self) -> Option<u32>;

    /// Writes raw text to the shell's stdin.
    async fn write_input(&mut self, input: &str) -> Result<(), SessionError>;

    /// Reads the next output line. Returns `None` once both pipes are closed.
    async fn read_output_line(&mut self) -> Option<OutputLine>;

    /// Returns an already buffered line without waiting.
    fn try_read_output_line(&mut self) -> Option<OutputLine>;

    /// Returns whether the shell is still running.
    fn is_alive(&self) -> bool;

    /// Sends SIGINT to the shell's process group.
    fn interrupt(&self) -> Result<(), SessionError>;

    /// Terminates the shell, escalating to SIGKILL after `grace`.
    async fn terminate(&mut self, grace: Duration) -> Option<i32>;

    /// Subscribes to output lines as they are read, sentinel text removed.
    fn subscribe(&self) -> broadcast::Receiver<OutputLine>;

    /// Watch that holds the exit code once the shell has exited.
    fn exit_watch(&self) -> watch::Receiver<Option<i32>>;

    /// Stops forwarding lines to subscribers while internal commands run.
    fn set_muted(&self, muted: bool);
}

/// A shell spawned with piped stdio.
pub struct PipeShell {
    pid: Option<u32>,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    output_tx: broadcast::Sender<OutputLine>,
    exit: watch::Receiver<Option<i32>>,
    muted: Arc<AtomicBool>,
}

impl PipeShell {
    /// Spawns `shell` and starts its reader and waiter tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn spawn(shell: &str, tracker: &ChildTracker) -> Result<Self, SessionError> {
        let mut child = Command::new(shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", "dumb")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell, e)))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SessionError::SpawnFailed(format!(
                "{}: stdio pipes unavailable",
                shell
            )));
        };

        if let Some(pid) = pid {
            tracker.register(pid);
        }

        let (line_tx, lines) = mpsc::unbounded_channel();
        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (exit_tx, exit) = watch::channel(None);
        let muted = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_pipe(
            stdout,
            OutputStream::Stdout,
            line_tx.clone(),
            output_tx.clone(),
            Arc::clone(&muted),
        ));
        tokio::spawn(read_pipe(
            stderr,
            OutputStream::Stderr,
            line_tx,
            output_tx.clone(),
            Arc::clone(&muted),
        ));

        let tracker = tracker.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(pid = ?pid, "Failed to wait for shell: {}", e);
                    -1
                }
            };
            if let Some(pid) = pid {
                tracker.unregister(pid);
            }
            tracing::debug!(pid = ?pid, exit_code = code, "Shell exited");
            exit_tx.send_replace(Some(code));
        });

        let mut shell = Self {
            pid,
            stdin,
            lines,
            output_tx,
            exit,
            muted,
        };
        shell.write_input(SHELL_PRELUDE).await?;

        Ok(shell)
    }
}

#[async_trait]
impl ShellProcess for PipeShell {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write_input(&mut self, input: &str) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Terminated("shell has exited".to_string()));
        }
        self.stdin.write_all(input.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_output_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    fn try_read_output_line(&mut self) -> Option<OutputLine> {
        self.lines.try_recv().ok()
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn interrupt(&self) -> Result<(), SessionError> {
        let pid = self
            .pid
            .ok_or_else(|| SessionError::Terminated("shell has no pid".to_string()))?;
        lifecycle::signal_group(pid, Signal::SIGINT).map_err(std::io::Error::from)?;
        Ok(())
    }

    async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        let Some(pid) = self.pid else {
            return current_exit(&self.exit);
        };
        lifecycle::terminate_group(pid, &mut self.exit.clone(), grace).await
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.output_tx.subscribe()
    }

    fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

/// Reads one pipe line by line, feeding the dispatcher channel and the
/// subscriber broadcast.
async fn read_pipe<R>(
    pipe: R,
    stream: OutputStream,
    lines: mpsc::UnboundedSender<OutputLine>,
    output: broadcast::Sender<OutputLine>,
    muted: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        let eof = match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(read) => read == 0,
            Err(e) => {
                tracing::debug!(stream = ?stream, "Shell pipe read failed: {}", e);
                break;
            }
        };
        if eof && buf.is_empty() {
            break;
        }

        let cut = if eof || buf.ends_with(b"\n") || buf.len() < MAX_LINE_BYTES {
            buf.len()
        } else {
            sentinel_safe_cut(&buf)
        };
        let text = String::from_utf8_lossy(trim_newline(&buf[..cut])).into_owned();
        buf.drain(..cut);

        if !muted.load(Ordering::SeqCst) {
            if let Some(visible) = visible_text(&text) {
                // No subscribers is fine.
                let _ = output.send(OutputLine::new(stream, visible));
            }
        }

        if lines.send(OutputLine::new(stream, text)).is_err() || eof {
            break;
        }
    }
}

/// Reads up to and including the next newline, stopping early once `buf`
/// holds `max` bytes. Returns the number of bytes read; 0 means EOF.
///
/// `buf` must hold fewer than `max` bytes on entry. Cancel safe: bytes
/// already consumed stay in `buf`.
pub async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }

        let room = max.saturating_sub(buf.len()).min(available.len());
        let (used, done) = match available[..room].iter().position(|b| *b == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (room, buf.len() + room >= max),
        };
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        read += used;

        if done {
            return Ok(read);
        }
    }
}

/// Where to split an overlong line: before any sentinel token that would
/// straddle the cut, and on a UTF-8 character boundary.
fn sentinel_safe_cut(buf: &[u8]) -> usize {
    let mut cut = buf.len().saturating_sub(SENTINEL_LEN);
    let window = cut.saturating_sub(SENTINEL_LEN);
    let straddling = buf[window..]
        .windows(SENTINEL_PREFIX.len())
        .enumerate()
        .filter(|(idx, w)| window + idx < cut && *w == SENTINEL_PREFIX.as_bytes())
        .last();
    if let Some((idx, _)) = straddling {
        cut = window + idx;
    }
    char_boundary(buf, cut)
}

/// Length of `buf` without a trailing incomplete UTF-8 sequence. Never 0
/// for a non-empty `buf`.
pub fn complete_utf8_len(buf: &[u8]) -> usize {
    let len = buf.len();
    let Some(lead) = (len.saturating_sub(4)..len)
        .rev()
        .find(|&idx| buf[idx] & 0xC0 != 0x80)
    else {
        return len;
    };
    let width = match buf[lead] {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    };
    if lead > 0 && lead + width > len {
        lead
    } else {
        len
    }
}

/// Moves `cut` back to the start of a UTF-8 character. Never returns 0 for
/// a non-zero `cut`.
pub fn char_boundary(buf: &[u8], cut: usize) -> usize {
    let mut at = cut;
    while at > 0 && at < buf.len() && buf[at] & 0xC0 == 0x80 {
        at -= 1;
    }
    if at == 0 {
        cut
    } else {
        at
    }
}

fn current_exit(exit: &watch::Receiver<Option<i32>>) -> Option<i32> {
    *exit.borrow()
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Strips sentinel text from a line. Returns `None` when nothing is left.
fn visible_text(text: &str) -> Option<&str> {
    match dispatcher::find_token(text) {
        Some(0) => None,
        Some(idx) => Some(&text[..idx]),
        None => Some(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::dispatcher::Sentinel;
    use tokio::time::timeout;

    async fn spawn_sh() -> PipeShell {
        PipeShell::spawn("/bin/sh", &ChildTracker::new()).await.unwrap()
    }

    async fn next_line(shell: &mut PipeShell) -> OutputLine {
        timeout(Duration::from_secs(5), shell.read_output_line())
            .await
            .expect("timed out waiting for output")
            .expect("pipes closed")
    }

    #[test]
    fn test_trim_newline() {
        assert_eq!(trim_newline(b"abc\n"), b"abc");
        assert_eq!(trim_newline(b"abc\r\n"), b"abc");
        assert_eq!(trim_newline(b"abc"), b"abc");
    }

    #[test]
    fn test_visible_text_strips_sentinel() {
        let token = Sentinel::generate().token().to_string();
        assert_eq!(visible_text("hello"), Some("hello"));
        assert_eq!(visible_text(&format!("{token} 0")), None);
        assert_eq!(visible_text(&format!("partial{token} 0")), Some("partial"));
    }

    #[test]
    fn test_visible_text_keeps_prefix_lookalikes() {
        assert_eq!(visible_text("__TERMGATE_abc__ 0"), Some("__TERMGATE_abc__ 0"));
        assert_eq!(visible_text("grep __TERMGATE_ log"), Some("grep __TERMGATE_ log"));
    }

    #[tokio::test]
    async fn test_read_line_capped_splits_long_lines() {
        let data = format!("{}\nshort\n", "a".repeat(10));
        let mut reader = BufReader::with_capacity(4, data.as_bytes());
        let mut buf = Vec::new();

        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), 8);
        assert_eq!(buf, b"aaaaaaaa");
        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), 3);
        assert_eq!(buf, b"aa\n");
        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), 6);
        assert_eq!(buf, b"short\n");
        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), 0);
    }

    #[test]
    fn test_cut_never_splits_a_token() {
        let token = Sentinel::generate().token().to_string();
        for offset in 0..SENTINEL_LEN * 2 {
            let mut line = "x".repeat(MAX_LINE_BYTES - SENTINEL_LEN - offset).into_bytes();
            line.extend_from_slice(token.as_bytes());
            line.resize(MAX_LINE_BYTES, b'y');

            let cut = sentinel_safe_cut(&line);
            let head = String::from_utf8_lossy(&line[..cut]);
            let tail = String::from_utf8_lossy(&line[cut..]);
            assert!(
                head.contains(&token) || tail.contains(&token),
                "token split at offset {}",
                offset
            );
        }
    }

    #[test]
    fn test_complete_utf8_len() {
        let text = "aé".as_bytes();
        assert_eq!(complete_utf8_len(text), 3);
        assert_eq!(complete_utf8_len(&text[..2]), 1);
        assert_eq!(complete_utf8_len(b"abc"), 3);
        assert_eq!(complete_utf8_len(&"€".as_bytes()[..2]), 2);
    }

    #[test]
    fn test_char_boundary() {
        let text = "aé".as_bytes();
        assert_eq!(char_boundary(text, 2), 1);
        assert_eq!(char_boundary(text, 1), 1);
        assert_eq!(char_boundary(text, 3), 3);
    }

    #[tokio::test]
    async fn test_long_line_arrives_in_bounded_pieces() {
        let mut shell = spawn_sh().await;
        let total = MAX_LINE_BYTES * 3 + 100;

        shell
            .write_input(&format!("head -c {} /dev/zero | tr '\\0' a; echo\n", total))
            .await
            .unwrap();

        let mut received = 0;
        while received < total {
            let line = next_line(&mut shell).await;
            assert!(line.text.len() <= MAX_LINE_BYTES);
            assert!(line.text.bytes().all(|b| b == b'a'));
            received += line.text.len();
        }
        assert_eq!(received, total);

        shell.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_spawn_missing_shell_fails() {
        let result = PipeShell::spawn("/nonexistent/shell", &ChildTracker::new()).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_registers_pid() {
        let tracker = ChildTracker::new();
        let mut shell = PipeShell::spawn("/bin/sh", &tracker).await.unwrap();

        let pid = shell.pid().unwrap();
        assert_eq!(tracker.snapshot(), vec![pid]);
        assert!(shell.is_alive());

        shell.terminate(Duration::from_secs(1)).await;
        assert!(!shell.is_alive());

        // The waiter task unregisters right before publishing the exit code.
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_reads_stdout_and_stderr() {
        let mut shell = spawn_sh().await;

        shell.write_input("echo out\n").await.unwrap();
        let line = next_line(&mut shell).await;
        assert_eq!(line, OutputLine::new(OutputStream::Stdout, "out"));

        shell.write_input("echo err >&2\n").await.unwrap();
        let line = next_line(&mut shell).await;
        assert_eq!(line, OutputLine::new(OutputStream::Stderr, "err"));

        shell.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_broadcast_filters_sentinel_and_mute() {
        let mut shell = spawn_sh().await;
        let mut rx = shell.subscribe();

        shell.set_muted(true);
        shell.write_input("echo hidden\n").await.unwrap();
        next_line(&mut shell).await;
        shell.set_muted(false);

        let token = Sentinel::generate().token().to_string();
        shell
            .write_input(&format!("echo shown; echo {token} 0\n"))
            .await
            .unwrap();
        next_line(&mut shell).await;
        next_line(&mut shell).await;

        let line = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(line.text, "shown");
        assert!(rx.try_recv().is_err());

        shell.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_exit_reported() {
        let mut shell = spawn_sh().await;
        let mut exit = shell.exit_watch();

        shell.write_input("exit 7\n").await.unwrap();

        let code = *timeout(Duration::from_secs(5), exit.wait_for(|c| c.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(7));
        assert!(!shell.is_alive());
        assert!(shell.read_output_line().await.is_none());

        let result = shell.write_input("echo late\n").await;
        assert!(matches!(result, Err(SessionError::Terminated(_))));
    }

    #[tokio::test]
    async fn test_interrupt_keeps_shell_alive() {
        let mut shell = spawn_sh().await;

        shell.write_input("sleep 30; echo after\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shell.interrupt().unwrap();

        let line = next_line(&mut shell).await;
        assert_eq!(line.text, "after");
        assert!(shell.is_alive());

        shell.terminate(Duration::from_secs(1)).await;
    }
}
