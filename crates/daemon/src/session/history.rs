//! Bounded per-session command history.

use std::collections::VecDeque;

use protocol::messages::HistoryEntry;

/// Ring buffer of the most recent commands run in a session.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl History {
    /// Creates an empty history holding at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    /// Appends an entry, evicting the oldest one when full.
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Returns the last `n` entries (all when `None`), oldest first.
    pub fn recent(&self, n: Option<usize>) -> Vec<HistoryEntry> {
        let n = n.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries
            .iter()
            .skip(self.entries.len() - n)
            .cloned()
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no command has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
