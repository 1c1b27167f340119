use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use time::OffsetDateTime;

use crate::clock::{now_local_or_utc, parse_rotation_timestamp, rotation_timestamp};
use crate::LogmuxError;

/// The abstract sink contract behind a destination.
///
/// `FileBackend` is the built-in implementation; syslog and plugin backends
/// implement this trait and are registered through a scheme factory.
pub trait Backend: Send {
    /// Appends one record (or one coalesced batch). Returns the number of
    /// bytes accepted; a successful call accepts the whole buffer.
    fn write(&mut self, buf: &[u8]) -> Result<usize, LogmuxError>;

    fn flush(&mut self) -> Result<(), LogmuxError>;

    fn close(&mut self) -> Result<(), LogmuxError>;

    /// Whether a single `write` is atomic with respect to concurrent
    /// writers of the same sink.
    fn supports_atomic(&self) -> bool;
}

// Polling step while waiting for a contended advisory lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// An open append-only log file with its advisory whole-file lock.
///
/// The path never changes after creation: rotation renames the live file
/// away and re-opens the same path. The advisory lock is held for the
/// duration of each write and for the entire rotation sequence, so
/// cooperating processes interleave only at record boundaries.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    size: u64,
    created_at: OffsetDateTime,
    lock_timeout: Duration,
}

impl FileBackend {
    /// Opens (or creates) `path` for appending.
    ///
    /// Missing parent directories are created. `size` starts at the
    /// current file length so size-based rotation honors pre-existing
    /// content.
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self, LogmuxError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| LogmuxError::FileOpen {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = open_append(path)?;
        let size = file
            .metadata()
            .map_err(|source| LogmuxError::FileOpen {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            // the filesystem creation date is unreliable on the major
            // platforms, so age-based rotation measures from open time
            created_at: now_local_or_utc(),
            lock_timeout,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether appending `incoming` more bytes requires rotating first.
    ///
    /// `incoming` includes any batch bytes pending for this file.
    pub(crate) fn needs_rotation(
        &self,
        incoming: u64,
        max_size: u64,
        max_age: Option<Duration>,
    ) -> bool {
        if max_size > 0 && self.size + incoming > max_size {
            return true;
        }
        if let Some(age) = max_age {
            let elapsed = now_local_or_utc() - self.created_at;
            if elapsed.whole_seconds() >= 0 && elapsed.unsigned_abs() >= age {
                return true;
            }
        }
        false
    }

    fn lock_with_timeout(&self) -> Result<(), LogmuxError> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.file.try_lock_exclusive() {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(LogmuxError::FileLock {
                            path: self.path.clone(),
                            timeout_ms: self.lock_timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(source) => {
                    return Err(LogmuxError::FileWrite {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }

    fn unlock(&self) {
        // releasing a lock we hold cannot meaningfully fail
        self.file.unlock().ok();
    }

    // One short write is retried with the remaining tail; a second short
    // write is surfaced as an error.
    fn write_all_checked(&mut self, buf: &[u8]) -> Result<usize, LogmuxError> {
        let mut written = 0usize;
        let mut short_writes = 0u8;
        while written < buf.len() {
            let n = (&self.file)
                .write(&buf[written..])
                .map_err(|source| LogmuxError::FileWrite {
                    path: self.path.clone(),
                    source,
                })?;
            written += n;
            if written < buf.len() {
                short_writes += 1;
                if n == 0 || short_writes > 1 {
                    return Err(LogmuxError::FileWrite {
                        path: self.path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "short write persisted after retry",
                        ),
                    });
                }
            }
        }
        Ok(written)
    }

    /// Rotates the live file: rename to a timestamped sibling, re-open the
    /// same path empty. Returns the rotated path.
    ///
    /// Both the per-destination lock (held by the caller) and the advisory
    /// file lock (taken here) cover the whole sequence. A rename failure
    /// aborts the rotation and leaves the live file writable.
    pub(crate) fn rotate(&mut self) -> Result<PathBuf, LogmuxError> {
        self.lock_with_timeout()?;

        let result = self.rotate_locked();
        self.unlock();
        result
    }

    fn rotate_locked(&mut self) -> Result<PathBuf, LogmuxError> {
        (&self.file).flush().map_err(|source| LogmuxError::FileFlush {
            path: self.path.clone(),
            source,
        })?;

        let rotated = next_rotated_path(&self.path);
        if let Err(source) = std::fs::rename(&self.path, &rotated) {
            // the live file is still in place; keep writing through the
            // existing handle and let the next trigger retry
            if let Ok(reopened) = open_append(&self.path) {
                self.file = reopened;
            }
            return Err(LogmuxError::FileRotate {
                path: self.path.clone(),
                source,
            });
        }

        match open_append(&self.path) {
            Ok(fresh) => {
                self.file = fresh;
                self.size = 0;
                self.created_at = now_local_or_utc();
                Ok(rotated)
            }
            Err(e) => {
                // rename succeeded but the fresh file did not open; put the
                // bytes back so nothing committed is lost
                std::fs::rename(&rotated, &self.path).ok();
                if let Ok(reopened) = open_append(&self.path) {
                    self.file = reopened;
                }
                Err(e)
            }
        }
    }
}

impl Backend for FileBackend {
    fn write(&mut self, buf: &[u8]) -> Result<usize, LogmuxError> {
        self.lock_with_timeout()?;
        let result = self.write_all_checked(buf);
        self.unlock();
        let n = result?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), LogmuxError> {
        self.file.sync_data().map_err(|source| LogmuxError::FileFlush {
            path: self.path.clone(),
            source,
        })
    }

    fn close(&mut self) -> Result<(), LogmuxError> {
        self.file.sync_data().map_err(|source| LogmuxError::FileClose {
            path: self.path.clone(),
            source,
        })
    }

    fn supports_atomic(&self) -> bool {
        true
    }
}

fn open_append(path: &Path) -> Result<File, LogmuxError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LogmuxError::FileOpen {
            path: path.to_path_buf(),
            source,
        })
}

// Rotated names embed a nanosecond UTC timestamp, so two names colliding
// means the clock stood still; re-read it until the name is free.
fn next_rotated_path(base: &Path) -> PathBuf {
    loop {
        let candidate = rotated_path(base, OffsetDateTime::now_utc());
        if !candidate.exists() {
            return candidate;
        }
    }
}

fn rotated_path(base: &Path, ts: OffsetDateTime) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(rotation_timestamp(ts));
    PathBuf::from(name)
}

/// One rotated companion of a base path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RotatedFile {
    pub path: PathBuf,
    pub timestamp: OffsetDateTime,
    pub compressed: bool,
}

/// Enumerates rotated companions of `base`, newest first.
///
/// Also returns the entries that share the prefix but whose suffix does not
/// parse as a rotation timestamp; callers surface those as warnings.
pub(crate) fn list_rotated_files(base: &Path) -> (Vec<RotatedFile>, Vec<PathBuf>) {
    let mut pattern = glob::Pattern::escape(&base.as_os_str().to_string_lossy());
    pattern.push_str(".*");

    let mut files = Vec::new();
    let mut skipped = Vec::new();
    let prefix = format!("{}.", base.as_os_str().to_string_lossy());
    for entry in glob::glob(&pattern).into_iter().flatten().flatten() {
        let full = entry.as_os_str().to_string_lossy().to_string();
        let suffix = match full.strip_prefix(&prefix) {
            Some(s) => s,
            None => continue,
        };
        let (stamp, compressed) = match suffix.strip_suffix(".gz") {
            Some(s) => (s, true),
            None => (suffix, false),
        };
        match parse_rotation_timestamp(stamp) {
            Some(timestamp) => files.push(RotatedFile {
                path: entry,
                timestamp,
                compressed,
            }),
            None => skipped.push(entry),
        }
    }
    files.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    (files, skipped)
}

/// Deletes the oldest rotated companions of `base` until at most
/// `max_files` remain. Returns the removed paths.
pub(crate) fn enforce_max_files(base: &Path, max_files: usize) -> Vec<PathBuf> {
    if max_files == 0 {
        return Vec::new();
    }
    let (files, _) = list_rotated_files(base);
    let mut removed = Vec::new();
    for stale in files.iter().skip(max_files) {
        if std::fs::remove_file(&stale.path).is_ok() {
            removed.push(stale.path.clone());
        }
    }
    removed
}

/// Deletes rotated companions of `base` older than `max_age`. Returns the
/// removed paths.
pub(crate) fn enforce_max_age(base: &Path, max_age: Duration) -> Vec<PathBuf> {
    let cutoff = OffsetDateTime::now_utc() - max_age;
    let (files, _) = list_rotated_files(base);
    let mut removed = Vec::new();
    for stale in files.iter().filter(|f| f.timestamp < cutoff) {
        if std::fs::remove_file(&stale.path).is_ok() {
            removed.push(stale.path.clone());
        }
    }
    removed
}
