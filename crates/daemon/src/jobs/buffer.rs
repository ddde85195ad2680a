//! Append-only output buffer shared by a job's drain task and its readers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Line appended once when the byte cap is reached.
pub const TRUNCATION_NOTICE: &str = "[output truncated]";

#[derive(Debug, Default)]
struct Inner {
    lines: Vec<String>,
    bytes: usize,
    truncated: bool,
    closed: bool,
}

/// Lines read since a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    /// New lines, oldest first.
    pub lines: Vec<String>,
    /// No more lines will be appended.
    pub closed: bool,
}

/// Growing list of output lines with a byte cap.
///
/// Readers never consume anything: every snapshot is a prefix of every
/// later one. Writers bump a version counter that readers can watch.
#[derive(Debug)]
pub struct OutputBuffer {
    inner: Mutex<Inner>,
    max_bytes: usize,
    version: watch::Sender<u64>,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `max_bytes` of line text.
    pub fn new(max_bytes: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes,
            version,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Appends a line. Returns `false` if it was dropped.
    pub fn push_line(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        {
            let mut inner = self.inner();
            if inner.closed || inner.truncated {
                return false;
            }
            let cost = line.len() + 1;
            if inner.bytes + cost > self.max_bytes {
                inner.truncated = true;
                inner.lines.push(TRUNCATION_NOTICE.to_string());
            } else {
                inner.bytes += cost;
                inner.lines.push(line);
            }
        }
        self.notify();
        !self.is_truncated()
    }

    /// Marks the buffer complete.
    pub fn close(&self) {
        self.inner().closed = true;
        self.notify();
    }

    /// Returns whether the buffer is complete.
    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Returns whether output was dropped because of the cap.
    pub fn is_truncated(&self) -> bool {
        self.inner().truncated
    }

    /// Number of stored lines.
    pub fn line_count(&self) -> usize {
        self.inner().lines.len()
    }

    /// All lines joined with `\n`.
    pub fn text(&self) -> String {
        self.inner().lines.join("\n")
    }

    /// Lines from index `cursor` onwards.
    pub fn lines_from(&self, cursor: usize) -> Slice {
        let inner = self.inner();
        Slice {
            lines: inner.lines.get(cursor..).map(<[String]>::to_vec).unwrap_or_default(),
            closed: inner.closed,
        }
    }

    /// Watch that changes whenever a line is appended or the buffer closes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_text() {
        let buffer = OutputBuffer::new(1024);
        assert!(buffer.push_line("one"));
        assert!(buffer.push_line("two"));

        assert_eq!(buffer.text(), "one\ntwo");
        assert_eq!(buffer.line_count(), 2);
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn test_cap_appends_notice_once() {
        let buffer = OutputBuffer::new(10);
        assert!(buffer.push_line("12345"));
        assert!(!buffer.push_line("67890"));
        assert!(!buffer.push_line("more"));

        assert!(buffer.is_truncated());
        assert_eq!(buffer.text(), format!("12345\n{}", TRUNCATION_NOTICE));
    }

    #[test]
    fn test_closed_drops_lines() {
        let buffer = OutputBuffer::new(1024);
        buffer.push_line("kept");
        buffer.close();

        assert!(!buffer.push_line("late"));
        assert!(buffer.is_closed());
        assert_eq!(buffer.text(), "kept");
    }

    #[test]
    fn test_lines_from_cursor() {
        let buffer = OutputBuffer::new(1024);
        for line in ["a", "b", "c"] {
            buffer.push_line(line);
        }

        assert_eq!(buffer.lines_from(1).lines, vec!["b", "c"]);
        assert!(buffer.lines_from(3).lines.is_empty());
        assert!(buffer.lines_from(10).lines.is_empty());
        assert!(!buffer.lines_from(0).closed);
    }

    #[test]
    fn test_snapshots_are_prefixes() {
        let buffer = OutputBuffer::new(64);
        let mut previous = buffer.text();
        for i in 0..20 {
            buffer.push_line(format!("line {}", i));
            let current = buffer.text();
            assert!(current.starts_with(&previous));
            previous = current;
        }
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let buffer = OutputBuffer::new(1024);
        let mut rx = buffer.subscribe();

        buffer.push_line("x");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        buffer.close();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }
}
