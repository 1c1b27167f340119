use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::backend::{Backend, FileBackend};
use crate::batch::{BatchConfig, BatchWriter};
use crate::format::Formatter;
use crate::metrics::{DestinationCounters, Metrics};
use crate::parameters::SharedSettings;
use crate::uri::DestinationUri;
use crate::LogmuxError;

/// Creates a backend for a registered scheme.
pub type BackendFactory =
    Arc<dyn Fn(&DestinationUri) -> Result<Box<dyn Backend>, LogmuxError> + Send + Sync>;

pub(crate) enum BackendKind {
    File(FileBackend),
    Custom(Box<dyn Backend>),
}

struct DestinationState {
    backend: BackendKind,
    batch: Option<BatchWriter>,
    formatter: Arc<dyn Formatter>,
}

/// A named sink: backend + formatter + batch buffer + counters.
///
/// All mutable state lives behind the per-destination lock; producers never
/// touch it, and the dispatcher never holds two destination locks at once.
pub(crate) struct Destination {
    name: String,
    scheme: String,
    enabled: AtomicBool,
    counters: DestinationCounters,
    state: Mutex<DestinationState>,
}

impl Destination {
    pub fn open_file(
        name: String,
        path: &std::path::Path,
        formatter: Arc<dyn Formatter>,
        batch: Option<BatchConfig>,
        lock_timeout: Duration,
    ) -> Result<Self, LogmuxError> {
        let backend = FileBackend::open(path, lock_timeout)?;
        Ok(Self {
            name,
            scheme: "file".to_string(),
            enabled: AtomicBool::new(true),
            counters: DestinationCounters::default(),
            state: Mutex::new(DestinationState {
                backend: BackendKind::File(backend),
                batch: batch.map(BatchWriter::new),
                formatter,
            }),
        })
    }

    pub fn open_custom(
        name: String,
        scheme: String,
        backend: Box<dyn Backend>,
        formatter: Arc<dyn Formatter>,
        batch: Option<BatchConfig>,
    ) -> Self {
        Self {
            name,
            scheme,
            enabled: AtomicBool::new(true),
            counters: DestinationCounters::default(),
            state: Mutex::new(DestinationState {
                backend: BackendKind::Custom(backend),
                batch: batch.map(BatchWriter::new),
                formatter,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn counters(&self) -> &DestinationCounters {
        &self.counters
    }

    /// The live file path, for file destinations.
    pub fn file_path(&self) -> Option<PathBuf> {
        match &self.state.lock().backend {
            BackendKind::File(f) => Some(f.path().to_path_buf()),
            BackendKind::Custom(_) => None,
        }
    }

    pub fn formatter(&self) -> Arc<dyn Formatter> {
        Arc::clone(&self.state.lock().formatter)
    }

    pub fn set_formatter(&self, formatter: Arc<dyn Formatter>) {
        self.state.lock().formatter = formatter;
    }

    /// Appends one formatted record, rotating first when required.
    ///
    /// Returns the rotated path when a rotation happened, so the caller can
    /// queue compression and retention.
    pub fn append(
        &self,
        bytes: &[u8],
        settings: &SharedSettings,
        metrics: &Metrics,
    ) -> Result<Option<PathBuf>, LogmuxError> {
        let mut state = self.state.lock();
        let rotated = self.rotate_if_needed(&mut state, bytes.len() as u64, settings, metrics)?;

        let flush_now = match state.batch.as_mut() {
            Some(batch) => batch.append(bytes),
            None => {
                self.write_through(&mut state, bytes, metrics)?;
                false
            }
        };
        if flush_now {
            self.flush_batch(&mut state, metrics)?;
        }
        Ok(rotated)
    }

    /// Interval flush, invoked from the dispatcher's idle cycle.
    pub fn tick(&self, metrics: &Metrics) -> Result<(), LogmuxError> {
        let mut state = self.state.lock();
        if state.batch.as_ref().map_or(false, BatchWriter::interval_elapsed) {
            self.flush_batch(&mut state, metrics)?;
        }
        Ok(())
    }

    /// Drains the batch buffer and pushes bytes down to the OS.
    pub fn flush(&self, metrics: &Metrics) -> Result<(), LogmuxError> {
        let mut state = self.state.lock();
        self.flush_batch(&mut state, metrics)?;
        match &mut state.backend {
            BackendKind::File(f) => f.flush(),
            BackendKind::Custom(b) => b.flush(),
        }
    }

    /// Flushes and closes the underlying sink.
    pub fn close(&self, metrics: &Metrics) -> Result<(), LogmuxError> {
        let mut state = self.state.lock();
        self.flush_batch(&mut state, metrics)?;
        match &mut state.backend {
            BackendKind::File(f) => f.close(),
            BackendKind::Custom(b) => b.close(),
        }
    }

    pub fn info(&self) -> DestinationInfo {
        DestinationInfo {
            name: self.name.clone(),
            scheme: self.scheme.clone(),
            enabled: self.is_enabled(),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            write_count: self.counters.write_count.load(Ordering::Relaxed),
            write_latency_nanos: self.counters.write_latency_nanos.load(Ordering::Relaxed),
            last_write_unix_nanos: self.counters.last_write_unix_nanos.load(Ordering::Relaxed),
            rotations: self.counters.rotations.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn rotate_if_needed(
        &self,
        state: &mut DestinationState,
        incoming: u64,
        settings: &SharedSettings,
        metrics: &Metrics,
    ) -> Result<Option<PathBuf>, LogmuxError> {
        let pending = state.batch.as_ref().map_or(0, BatchWriter::pending_bytes) as u64;
        let needed = match &state.backend {
            BackendKind::File(f) => {
                f.needs_rotation(pending + incoming, settings.max_size(), settings.max_age())
            }
            BackendKind::Custom(_) => false,
        };
        if !needed {
            return Ok(None);
        }

        // pending bytes belong to the file being rotated away
        self.flush_batch(state, metrics)?;
        let rotated = match &mut state.backend {
            BackendKind::File(f) => f.rotate()?,
            BackendKind::Custom(_) => unreachable!("only file backends rotate"),
        };
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        metrics.record_rotation();
        Ok(Some(rotated))
    }

    fn flush_batch(
        &self,
        state: &mut DestinationState,
        metrics: &Metrics,
    ) -> Result<(), LogmuxError> {
        let buf = match state.batch.as_mut() {
            Some(batch) if !batch.is_empty() => batch.take(),
            _ => return Ok(()),
        };
        self.write_through(state, &buf, metrics)
    }

    fn write_through(
        &self,
        state: &mut DestinationState,
        bytes: &[u8],
        metrics: &Metrics,
    ) -> Result<(), LogmuxError> {
        let start = Instant::now();
        let n = match &mut state.backend {
            BackendKind::File(f) => f.write(bytes)?,
            BackendKind::Custom(b) => b.write(bytes)?,
        };
        let latency = start.elapsed();
        metrics.record_write(n as u64, latency);
        self.counters.record_write(
            n as u64,
            latency,
            OffsetDateTime::now_utc().unix_timestamp_nanos() as u64,
        );
        Ok(())
    }
}

/// Public view of a destination, as returned by `list_destinations`.
#[derive(Clone, Debug, Serialize)]
pub struct DestinationInfo {
    pub name: String,
    pub scheme: String,
    pub enabled: bool,
    pub bytes_written: u64,
    pub write_count: u64,
    /// Cumulative write latency across all writes, in nanoseconds.
    pub write_latency_nanos: u64,
    /// Wall time of the last successful write, unix nanoseconds; 0 before
    /// the first write.
    pub last_write_unix_nanos: u64,
    pub rotations: u64,
    pub errors: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::TextFormatter;
    use crate::parameters::Compression;

    fn settings(max_size: u64) -> SharedSettings {
        SharedSettings::new(
            max_size,
            0,
            None,
            Compression::None,
            0,
            Duration::from_secs(5),
        )
    }

    fn open(dir: &std::path::Path, batch: Option<BatchConfig>) -> Destination {
        Destination::open_file(
            "test".to_string(),
            &dir.join("app.log"),
            Arc::new(TextFormatter::new()),
            batch,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn unbatched_append_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let dest = open(dir.path(), None);
        let metrics = Metrics::new();
        dest.append(b"one\n", &settings(0), &metrics).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log")).unwrap(),
            "one\n"
        );
        assert_eq!(metrics.snapshot().bytes_written, 4);
        assert_eq!(dest.info().write_count, 1);
    }

    #[test]
    fn batched_append_defers_until_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let dest = open(
            dir.path(),
            Some(BatchConfig {
                max_bytes: 8,
                max_entries: 100,
                flush_interval: Duration::from_secs(60),
            }),
        );
        let metrics = Metrics::new();
        dest.append(b"one\n", &settings(0), &metrics).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log")).unwrap(),
            ""
        );
        dest.append(b"two\n", &settings(0), &metrics).unwrap();
        // threshold crossed: both records in one coalesced write
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log")).unwrap(),
            "one\ntwo\n"
        );
        assert_eq!(metrics.snapshot().write_count, 1);
    }

    #[test]
    fn flush_drains_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = open(dir.path(), Some(BatchConfig::default()));
        let metrics = Metrics::new();
        dest.append(b"one\n", &settings(0), &metrics).unwrap();
        dest.flush(&metrics).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log")).unwrap(),
            "one\n"
        );
    }

    #[test]
    fn rotation_carries_pending_batch_into_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = open(
            dir.path(),
            Some(BatchConfig {
                max_bytes: 1024,
                max_entries: 100,
                flush_interval: Duration::from_secs(60),
            }),
        );
        let metrics = Metrics::new();
        let s = settings(10);
        dest.append(b"12345\n", &s, &metrics).unwrap();
        // 6 pending + 6 incoming > 10: flush + rotate first
        let rotated = dest.append(b"67890\n", &s, &metrics).unwrap().unwrap();
        dest.flush(&metrics).unwrap();

        assert_eq!(std::fs::read(&rotated).unwrap(), b"12345\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log")).unwrap(),
            "67890\n"
        );
        assert_eq!(metrics.snapshot().rotations, 1);
        assert_eq!(dest.info().rotations, 1);
    }

    #[test]
    fn every_oversized_write_rotates_once() {
        let dir = tempfile::tempdir().unwrap();
        let dest = open(dir.path(), None);
        let metrics = Metrics::new();
        let s = settings(1);
        for i in 0..4 {
            dest.append(format!("r{}\n", i).as_bytes(), &s, &metrics)
                .unwrap();
        }
        let (files, _) = crate::backend::list_rotated_files(&dir.path().join("app.log"));
        assert_eq!(files.len(), 4);
        // live file holds only the latest record
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.log")).unwrap(),
            "r3\n"
        );
    }
}
