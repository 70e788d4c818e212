//! Process-wide connection and throughput counters.
//!
//! Grounded in `original_source/src/metrics/metrics.c`: a handful of
//! monotonically-increasing counters plus a server start time, readable as a
//! snapshot. Atomics are enough here, unlike `UserStore` and `ConnectionLog`
//! which need a lock because they touch more than one field at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A point-in-time read of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub current_connections: u64,
    pub bytes_transferred: u64,
    pub server_start_time: u64,
}

/// Thread-safe counters updated from the main loop and read from the
/// management listener.
pub struct Metrics {
    total_connections: AtomicU64,
    current_connections: AtomicU64,
    bytes_transferred: AtomicU64,
    server_start_time: u64,
}

impl Metrics {
    pub fn new() -> Self {
        let server_start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Metrics {
            total_connections: AtomicU64::new(0),
            current_connections: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            server_start_time,
        }
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            server_start_time: self.server_start_time,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();

        let snap = m.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.current_connections, 1);
    }

    #[test]
    fn test_bytes_accumulate() {
        let m = Metrics::new();
        m.add_bytes(100);
        m.add_bytes(24);
        assert_eq!(m.snapshot().bytes_transferred, 124);
    }
}
