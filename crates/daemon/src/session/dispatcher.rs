//! Command dispatch over a raw shell pipe.
//!
//! A pipe gives no signal that a command has finished, so every command is
//! followed by a sentinel: a fresh random token the shell prints on stdout
//! together with `$?`, then alone on stderr. Output is everything read
//! before the token.
//!
//! ```text
//! <command>
//! printf '%s %s\n' __TERMGATE_<hex>__ "$?"; printf '%s\n' __TERMGATE_<hex>__ >&2
//! ```
//!
//! A command that prints the token itself ends its own output early. With
//! 128 random bits per call that needs the token to be guessed, so it is
//! treated as a known limitation rather than handled.

use std::time::Duration;

use tokio::time::Instant;

use super::process::ShellProcess;
use super::SessionError;
use protocol::OutputStream;

/// Prefix shared by every sentinel token.
pub const SENTINEL_PREFIX: &str = "__TERMGATE_";

/// Length of a full sentinel token: prefix, 32 hex digits, `__`.
pub const SENTINEL_LEN: usize = SENTINEL_PREFIX.len() + 32 + 2;

/// Output kept per stream for one command. Lines past it are read and
/// dropped.
pub const MAX_COMMAND_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Appended once when a stream hits [`MAX_COMMAND_OUTPUT_BYTES`].
pub const TRUNCATION_NOTICE: &str = "[output truncated]";

/// Pause between SIGINT and the resync write, so the shell has handled the
/// signal before it reads more input.
const INTERRUPT_SETTLE: Duration = Duration::from_millis(50);

/// Per-call completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

impl Sentinel {
    /// Generates a token with 128 random bits.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self {
            token: format!("{}{}__", SENTINEL_PREFIX, hex::encode(bytes)),
        }
    }

    /// The token text.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Builds the stdin payload for `command` followed by the marker lines.
    pub fn wrap(&self, command: &str) -> String {
        let command = command.trim_end_matches(['\n', '\r']);
        format!(
            "{cmd}\nprintf '%s %s\\n' {tok} \"$?\"; printf '%s\\n' {tok} >&2\n",
            cmd = command,
            tok = self.token
        )
    }

    /// Splits a line around the token.
    ///
    /// Returns the text before the token (an unterminated last output line)
    /// and the trimmed text after it, or `None` if the token is absent.
    pub fn split<'a>(&self, line: &'a str) -> Option<(&'a str, &'a str)> {
        let idx = line.find(&self.token)?;
        let rest = &line[idx + self.token.len()..];
        Some((&line[..idx], rest.trim()))
    }
}

/// Byte offset of the first sentinel-shaped token in `text`.
///
/// Only the full shape counts, so output that merely mentions the prefix is
/// left alone.
pub fn find_token(text: &str) -> Option<usize> {
    text.match_indices(SENTINEL_PREFIX).map(|(idx, _)| idx).find(|&idx| {
        let Some(token) = text.get(idx..idx + SENTINEL_LEN) else {
            return false;
        };
        let digits = &token.as_bytes()[SENTINEL_PREFIX.len()..SENTINEL_LEN - 2];
        digits.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) && token.ends_with("__")
    })
}

/// What a dispatched command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Stdout lines, marker excluded.
    pub stdout: Vec<String>,
    /// Stderr lines, marker excluded.
    pub stderr: Vec<String>,
    /// Bytes kept in `stdout` and `stderr`.
    kept: [usize; 2],
    /// `$?` as reported by the shell.
    pub exit_code: Option<i32>,
    /// The deadline passed before both markers arrived.
    pub timed_out: bool,
}

impl CommandOutcome {
    fn push(&mut self, stream: OutputStream, line: String) {
        let (lines, kept) = match stream {
            OutputStream::Stderr => (&mut self.stderr, &mut self.kept[1]),
            _ => (&mut self.stdout, &mut self.kept[0]),
        };
        if *kept > MAX_COMMAND_OUTPUT_BYTES {
            return;
        }
        *kept += line.len() + 1;
        if *kept > MAX_COMMAND_OUTPUT_BYTES {
            lines.push(TRUNCATION_NOTICE.to_string());
        } else {
            lines.push(line);
        }
    }

    /// Stdout joined with `\n`.
    pub fn output(&self) -> String {
        self.stdout.join("\n")
    }

    /// Stderr joined with `\n`.
    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Runs one command and collects its output up to the sentinel.
///
/// Lines left over from earlier activity are discarded first. On timeout
/// the partial output is returned with `timed_out` set; the shell is then
/// out of step and must be resynchronized with [`resync`] before reuse.
pub async fn run_command(
    process: &mut dyn ShellProcess,
    command: &str,
    limit: Duration,
) -> Result<CommandOutcome, SessionError> {
    let mut stale = 0usize;
    while process.try_read_output_line().is_some() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!(lines = stale, "Discarded stale shell output");
    }

    let deadline = Instant::now()
        .checked_add(limit)
        .ok_or_else(|| SessionError::InvalidTimeout(format!("{:?} is out of range", limit)))?;

    let sentinel = Sentinel::generate();
    process.write_input(&sentinel.wrap(command)).await?;

    let mut outcome = CommandOutcome::default();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        let line = match tokio::time::timeout_at(deadline, process.read_output_line()).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(SessionError::Terminated(
                    "shell exited while running a command".to_string(),
                ))
            }
            Err(_) => {
                outcome.timed_out = true;
                break;
            }
        };

        match (line.stream, sentinel.split(&line.text)) {
            (OutputStream::Stderr, Some((before, _))) => {
                if !before.is_empty() {
                    outcome.push(OutputStream::Stderr, before.to_string());
                }
                stderr_done = true;
            }
            (_, Some((before, status))) => {
                if !before.is_empty() {
                    outcome.push(OutputStream::Stdout, before.to_string());
                }
                outcome.exit_code = status.parse().ok();
                stdout_done = true;
            }
            (stream, None) => outcome.push(stream, line.text),
        }
    }

    Ok(outcome)
}

/// Brings a shell back in step after a timeout.
///
/// Interrupts the foreground command, then waits for a fresh sentinel and
/// discards everything before it. Returns `false` if the sentinel did not
/// show up within `limit`.
pub async fn resync(process: &mut dyn ShellProcess, limit: Duration) -> Result<bool, SessionError> {
    process.interrupt()?;
    tokio::time::sleep(INTERRUPT_SETTLE).await;

    let outcome = run_command(process, "true", limit).await?;
    Ok(!outcome.timed_out)
}

/// Asks the shell for its working directory.
///
/// The query is hidden from stream subscribers. Returns `None` if `pwd`
/// failed or timed out; a timed-out query is resynchronized before
/// returning.
pub async fn query_cwd(
    process: &mut dyn ShellProcess,
    limit: Duration,
) -> Result<Option<String>, SessionError> {
    process.set_muted(true);
    let outcome = run_command(process, "pwd", limit).await;
    process.set_muted(false);
    let outcome = outcome?;

    if outcome.timed_out {
        resync(process, limit).await?;
        return Ok(None);
    }
    if outcome.exit_code != Some(0) {
        return Ok(None);
    }
    Ok(outcome.stdout.last().cloned())
}
