use std::time::{Duration, Instant};

/// Batch settings for one destination.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Flush when the buffer reaches this many bytes.
    pub max_bytes: usize,
    /// Flush when the buffer holds this many records.
    pub max_entries: usize,
    /// Flush a non-empty buffer that has waited this long.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024,
            max_entries: 100,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Per-destination accumulation buffer.
///
/// Records are appended whole and flushed whole; a record is never split
/// across underlying writes. The owner performs the actual write while
/// holding the per-destination lock.
#[derive(Debug)]
pub(crate) struct BatchWriter {
    buf: Vec<u8>,
    entries: usize,
    config: BatchConfig,
    last_flush: Instant,
}

impl BatchWriter {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            buf: Vec::with_capacity(config.max_bytes.min(64 * 1024)),
            entries: 0,
            config,
            last_flush: Instant::now(),
        }
    }

    /// Copies one formatted record into the buffer. Returns true when a
    /// threshold was crossed and the buffer should be flushed now.
    pub fn append(&mut self, record: &[u8]) -> bool {
        self.buf.extend_from_slice(record);
        self.entries += 1;
        self.buf.len() >= self.config.max_bytes || self.entries >= self.config.max_entries
    }

    /// Whether the interval timer should flush this buffer.
    pub fn interval_elapsed(&self) -> bool {
        !self.buf.is_empty() && self.last_flush.elapsed() >= self.config.flush_interval
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hands the accumulated bytes to the caller and resets the buffer.
    pub fn take(&mut self) -> Vec<u8> {
        self.entries = 0;
        self.last_flush = Instant::now();
        std::mem::take(&mut self.buf)
    }
}
