//! Bounded rolling log of recent proxied connections.
//!
//! Grounded in `original_source/src/admin/admin_commands.c`
//! (`admin_process_list_connections`, which reads from a `user_connection`
//! table) and §3/§4.6 of the design: a ring of the last `K` entries, oldest
//! evicted first, guarded by a single mutex.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default capacity recommended by the design.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A single proxied-connection record.
#[derive(Debug, Clone)]
pub struct ConnectionLogEntry {
    pub username: String,
    pub destination: String,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
}

/// Bounded FIFO of the most recent connection records.
pub struct ConnectionLog {
    capacity: usize,
    entries: Mutex<VecDeque<ConnectionLogEntry>>,
}

impl ConnectionLog {
    pub fn new(capacity: usize) -> Self {
        ConnectionLog {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an entry, evicting the oldest one if at capacity.
    pub fn push(&self, entry: ConnectionLogEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of all entries, most recent last.
    pub fn snapshot(&self) -> Vec<ConnectionLogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(username: &str) -> ConnectionLogEntry {
        ConnectionLogEntry {
            username: username.to_string(),
            destination: "example.com".to_string(),
            port: 80,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_push_and_snapshot() {
        let log = ConnectionLog::new(2);
        log.push(entry("a"));
        log.push(entry("b"));
        let snap = log.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].username, "a");
        assert_eq!(snap[1].username, "b");
    }

    #[test]
    fn test_eviction_at_capacity() {
        let log = ConnectionLog::new(2);
        log.push(entry("a"));
        log.push(entry("b"));
        log.push(entry("c"));

        let snap = log.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].username, "b");
        assert_eq!(snap[1].username, "c");
    }
}
