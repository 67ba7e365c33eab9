//! Bounded buffer of recent child-process output.
//!
//! Cleared on every `start()`; each entry also carries the generation it was
//! written for, so a reader can tell a late line from a previous process
//! apart from current output.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lines the supervisor writes itself (start/stop markers).
    Supervisor,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub source: LogSource,
    pub generation: u64,
    pub line: String,
}

impl LogEntry {
    pub fn new(generation: u64, source: LogSource, line: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            source,
            generation,
            line: line.into(),
        }
    }
}

struct Inner {
    entries: VecDeque<LogEntry>,
    generation: u64,
}

pub struct LogRing {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(4096)),
                generation: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines tagged with a generation older than the current one are dropped;
    /// a drain task of a replaced process can still be flushing its pipe.
    pub fn append(&self, entry: LogEntry) -> bool {
        let mut g = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if entry.generation < g.generation {
            return false;
        }
        if g.entries.len() == self.capacity {
            g.entries.pop_front();
        }
        g.entries.push_back(entry);
        true
    }

    /// Last `min(n, len)` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let g = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = g.entries.len().saturating_sub(n);
        g.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn generation(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Drops everything and starts accepting lines for `generation`.
    pub fn reset(&self, generation: u64) {
        let mut g = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        g.entries.clear();
        g.generation = generation;
    }

    /// The last `n` lines as plain text, used for error details.
    pub fn tail_text(&self, n: usize) -> Vec<String> {
        self.tail(n).into_iter().map(|e| e.line).collect()
    }
}
