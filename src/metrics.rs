use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::{ErrorSource, ERROR_SOURCE_COUNT};
use crate::level::{Level, LEVEL_COUNT};

/// Lock-free counters for the whole logger instance.
///
/// All counters are 64-bit atomics updated with relaxed ordering; the
/// snapshot is a copy-on-read value and makes no cross-counter consistency
/// promise beyond what relaxed atomics give.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    logged_by_level: [AtomicU64; LEVEL_COUNT],
    dropped: AtomicU64,
    sampled_out: AtomicU64,
    filtered: AtomicU64,
    rotations: AtomicU64,
    compressions: AtomicU64,
    retained_removed: AtomicU64,
    bytes_written: AtomicU64,
    write_count: AtomicU64,
    write_latency_nanos: AtomicU64,
    errors_by_source: [AtomicU64; ERROR_SOURCE_COUNT],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_logged(&self, level: Level) {
        self.logged_by_level[level as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_n(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_sampled_out(&self) {
        self.sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self) {
        self.compressions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retention_removal(&self) {
        self.retained_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64, latency: std::time::Duration) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_latency_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, source: ErrorSource) {
        self.errors_by_source[source.as_index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut by_level = BTreeMap::new();
        for i in 0..LEVEL_COUNT {
            let v = self.logged_by_level[i].load(Ordering::Relaxed);
            if v > 0 {
                by_level.insert(
                    Level::from_u8(i as u8).as_str().to_string(),
                    v,
                );
            }
        }
        let mut by_source = BTreeMap::new();
        for i in 0..ERROR_SOURCE_COUNT {
            let v = self.errors_by_source[i].load(Ordering::Relaxed);
            if v > 0 {
                by_source.insert(ErrorSource::from_index(i).as_str().to_string(), v);
            }
        }
        MetricsSnapshot {
            messages_logged: by_level.values().sum(),
            messages_logged_by_level: by_level,
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            messages_sampled_out: self.sampled_out.load(Ordering::Relaxed),
            messages_filtered: self.filtered.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            retention_removals: self.retained_removed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            write_latency_nanos: self.write_latency_nanos.load(Ordering::Relaxed),
            errors_by_source: by_source,
        }
    }

    pub fn reset(&self) {
        for c in &self.logged_by_level {
            c.store(0, Ordering::Relaxed);
        }
        for c in &self.errors_by_source {
            c.store(0, Ordering::Relaxed);
        }
        self.dropped.store(0, Ordering::Relaxed);
        self.sampled_out.store(0, Ordering::Relaxed);
        self.filtered.store(0, Ordering::Relaxed);
        self.rotations.store(0, Ordering::Relaxed);
        self.compressions.store(0, Ordering::Relaxed);
        self.retained_removed.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
        self.write_latency_nanos.store(0, Ordering::Relaxed);
    }
}

/// Copy-on-read view of all logger counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Sum of per-level counts.
    pub messages_logged: u64,
    pub messages_logged_by_level: BTreeMap<String, u64>,
    pub messages_dropped: u64,
    pub messages_sampled_out: u64,
    pub messages_filtered: u64,
    pub rotations: u64,
    pub compressions: u64,
    pub retention_removals: u64,
    pub bytes_written: u64,
    pub write_count: u64,
    pub write_latency_nanos: u64,
    pub errors_by_source: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Mean write latency, if any write completed.
    #[must_use]
    pub fn avg_write_latency(&self) -> Option<std::time::Duration> {
        if self.write_count == 0 {
            None
        } else {
            Some(std::time::Duration::from_nanos(
                self.write_latency_nanos / self.write_count,
            ))
        }
    }
}

/// Per-destination counters; separate from the logger-wide [`Metrics`].
#[derive(Debug, Default)]
pub(crate) struct DestinationCounters {
    pub bytes_written: AtomicU64,
    pub write_count: AtomicU64,
    pub write_latency_nanos: AtomicU64,
    pub rotations: AtomicU64,
    pub errors: AtomicU64,
    /// Wall time of the last successful write, unix nanoseconds.
    pub last_write_unix_nanos: AtomicU64,
}

impl DestinationCounters {
    pub fn record_write(&self, bytes: u64, latency: std::time::Duration, now_unix_nanos: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_latency_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        self.last_write_unix_nanos
            .store(now_unix_nanos, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn snapshot_reflects_counts() {
        let m = Metrics::new();
        m.record_logged(Level::Info);
        m.record_logged(Level::Info);
        m.record_logged(Level::Error);
        m.record_dropped();
        m.record_write(100, Duration::from_micros(50));
        m.record_error(ErrorSource::Write);

        let s = m.snapshot();
        assert_eq!(s.messages_logged, 3);
        assert_eq!(s.messages_logged_by_level["info"], 2);
        assert_eq!(s.messages_logged_by_level["error"], 1);
        assert_eq!(s.messages_dropped, 1);
        assert_eq!(s.bytes_written, 100);
        assert_eq!(s.errors_by_source["write"], 1);
        assert_eq!(s.avg_write_latency(), Some(Duration::from_micros(50)));
    }

    #[test]
    fn reset_zeroes_everything() {
        let m = Metrics::new();
        m.record_logged(Level::Warn);
        m.record_write(10, Duration::from_nanos(1));
        m.reset();
        let s = m.snapshot();
        assert_eq!(s.messages_logged, 0);
        assert_eq!(s.bytes_written, 0);
        assert!(s.messages_logged_by_level.is_empty());
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let m = Metrics::new();
        m.record_logged(Level::Debug);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"messages_logged\":1"));
    }
}
