use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

/// Compression applied to rotated files.
///
/// Used in [`LoggerBuilder::compression`](crate::LoggerBuilder) and
/// [`Logger::set_compression`](crate::Logger::set_compression).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compression {
    /// Rotated files are left as plain text.
    None,
    /// Rotated files are gzipped in the background; the original is removed
    /// after the `.gz` companion is complete.
    #[cfg(feature = "compress")]
    Gzip,
}

impl Compression {
    pub(crate) fn is_enabled(self) -> bool {
        !matches!(self, Self::None)
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            #[cfg(feature = "compress")]
            Self::Gzip => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            #[cfg(feature = "compress")]
            1 => Self::Gzip,
            _ => Self::None,
        }
    }
}

/// What a producer call does when the record queue is full.
///
/// Used in [`LoggerBuilder::overflow_policy`](crate::LoggerBuilder).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the new record, count it, and report through the error handler.
    /// The producer call returns `QueueFull` and never blocks.
    DropNewest,
    /// Block the producer until space frees up or the timeout passes
    /// (`None` blocks indefinitely).
    Block(Option<Duration>),
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::DropNewest
    }
}

pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub(crate) const DEFAULT_COMPRESSION_QUEUE_CAPACITY: usize = 100;
pub(crate) const DEFAULT_COMPRESSION_WORKERS: usize = 1;
pub(crate) const DEFAULT_FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime-mutable knobs shared between the facade, the dispatcher, the
/// destinations, and the sweeper.
///
/// Every knob is an atomic read on the dispatch path, so `set_*` calls take
/// effect no later than the next record dispatched. Zero means "unlimited"
/// for the size/age/count knobs.
#[derive(Debug)]
pub(crate) struct SharedSettings {
    max_size: AtomicU64,
    max_files: AtomicUsize,
    max_age_secs: AtomicU64,
    compression: AtomicU8,
    compress_min_age: AtomicUsize,
    lock_timeout_ms: AtomicU64,
}

impl SharedSettings {
    pub fn new(
        max_size: u64,
        max_files: usize,
        max_age: Option<Duration>,
        compression: Compression,
        compress_min_age: usize,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            max_size: AtomicU64::new(max_size),
            max_files: AtomicUsize::new(max_files),
            max_age_secs: AtomicU64::new(max_age.map_or(0, |d| d.as_secs())),
            compression: AtomicU8::new(compression.as_u8()),
            compress_min_age: AtomicUsize::new(compress_min_age),
            lock_timeout_ms: AtomicU64::new(lock_timeout.as_millis() as u64),
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, bytes: u64) {
        self.max_size.store(bytes, Ordering::Relaxed);
    }

    pub fn max_files(&self) -> usize {
        self.max_files.load(Ordering::Relaxed)
    }

    pub fn set_max_files(&self, count: usize) {
        self.max_files.store(count, Ordering::Relaxed);
    }

    pub fn max_age(&self) -> Option<Duration> {
        match self.max_age_secs.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn set_max_age(&self, age: Option<Duration>) {
        self.max_age_secs
            .store(age.map_or(0, |d| d.as_secs()), Ordering::Relaxed);
    }

    pub fn compression(&self) -> Compression {
        Compression::from_u8(self.compression.load(Ordering::Relaxed))
    }

    pub fn set_compression(&self, kind: Compression) {
        self.compression.store(kind.as_u8(), Ordering::Relaxed);
    }

    pub fn compress_min_age(&self) -> usize {
        self.compress_min_age.load(Ordering::Relaxed)
    }

    pub fn set_compress_min_age(&self, index: usize) {
        self.compress_min_age.store(index, Ordering::Relaxed);
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.load(Ordering::Relaxed))
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(
            0,
            0,
            None,
            Compression::None,
            0,
            DEFAULT_FILE_LOCK_TIMEOUT,
        )
    }
}
