//! Bounded lifecycle event log.
//!
//! Keeps the most recent session events (`qr`, `authenticated`, `ready`,
//! `disconnected:<reason>`, ...) with their timestamps so `/debug` can show
//! what the session went through without scraping process logs. Oldest
//! entries are evicted first once the log is full.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Smallest capacity the log accepts.
pub const MIN_CAPACITY: usize = 100;

/// Largest capacity the log accepts (and the default).
pub const MAX_CAPACITY: usize = 200;

/// One recorded lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLogEntry {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

/// FIFO ring of the last `capacity` events, safe to share across tasks.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<EventLogEntry>>,
}

impl EventLog {
    /// Create a log holding at most `capacity` entries, clamped to
    /// `MIN_CAPACITY..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `{kind, now}`, evicting the oldest entry when full.
    pub fn record(&self, kind: impl Into<String>) {
        let entry = EventLogEntry {
            kind: kind.into(),
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The last `n` entries in insertion order (all of them if fewer exist).
    pub fn recent(&self, n: usize) -> Vec<EventLogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(MAX_CAPACITY)
    }
}
