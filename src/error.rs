use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::clock::now_local_or_utc;

/// The error type produced by logmux operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LogmuxError {
    /// The logger was closed; no further records are accepted.
    #[error("logger is closed")]
    Closed,

    /// The bounded record queue was full and the overflow policy dropped
    /// the record.
    #[error("record queue is full")]
    QueueFull,

    /// The compression work queue was full; the rotated file stays
    /// uncompressed.
    #[error("compression queue is full")]
    CompressionQueueFull,

    /// The shutdown deadline passed before the queue was drained.
    #[error("shutdown timed out before the queue was drained")]
    ShutdownTimeout,

    /// No destination is registered under the given name.
    #[error("destination not found: {0}")]
    DestinationNotFound(String),

    /// A destination with the same name or file path already exists.
    #[error("duplicate destination: {0}")]
    DuplicateDestination(String),

    /// A configuration value or destination URI was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Opening a log file failed.
    #[error("cannot open log file {path}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing to a log file failed, or a write stayed short after a retry.
    #[error("cannot write to log file {path}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Flushing a log file failed.
    #[error("cannot flush log file {path}")]
    FileFlush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Renaming or reopening during rotation failed; the live file stays
    /// writable and the next trigger retries.
    #[error("cannot rotate log file {path}")]
    FileRotate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The advisory whole-file lock was not acquired within the timeout.
    #[error("advisory lock on {path} not acquired within {timeout_ms} ms")]
    FileLock { path: PathBuf, timeout_ms: u64 },

    /// Closing a log file failed.
    #[error("cannot close log file {path}")]
    FileClose {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A formatter failed on a record; the record was written without the
    /// failing transformation.
    #[error("formatting failed: {0}")]
    Format(String),

    /// The redactor failed on a record; the record was written unredacted.
    #[error("redaction failed: {0}")]
    Redaction(String),

    /// Any other I/O fault not bound to a destination path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LogmuxError {
    /// Whether retrying the failed operation may succeed.
    ///
    /// True for backpressure indicators, lock timeouts, and the transient
    /// platform conditions named in their `io::Error` messages.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull | Self::CompressionQueueFull | Self::FileLock { .. } => true,
            Self::FileOpen { source, .. }
            | Self::FileWrite { source, .. }
            | Self::FileFlush { source, .. }
            | Self::FileRotate { source, .. }
            | Self::FileClose { source, .. } => io_retryable(source),
            Self::Io(source) => io_retryable(source),
            _ => false,
        }
    }
}

fn io_retryable(e: &std::io::Error) -> bool {
    let msg = e.to_string();
    msg.contains("resource temporarily unavailable")
        || msg.contains("too many open files")
        || msg.contains("no space left on device")
}

/// Where an internal failure originated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    Queue,
    Write,
    Rotate,
    Compress,
    Flush,
    Lock,
    Destination,
    Config,
    Recovery,
}

pub(crate) const ERROR_SOURCE_COUNT: usize = 9;

impl ErrorSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Write => "write",
            Self::Rotate => "rotate",
            Self::Compress => "compress",
            Self::Flush => "flush",
            Self::Lock => "lock",
            Self::Destination => "destination",
            Self::Config => "config",
            Self::Recovery => "recovery",
        }
    }

    pub(crate) fn as_index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(i: usize) -> Self {
        match i {
            0 => Self::Queue,
            1 => Self::Write,
            2 => Self::Rotate,
            3 => Self::Compress,
            4 => Self::Flush,
            5 => Self::Lock,
            6 => Self::Destination,
            7 => Self::Config,
            _ => Self::Recovery,
        }
    }
}

/// One internal failure, as delivered to the error-handler hook.
#[derive(Debug)]
pub struct LogError {
    pub timestamp: OffsetDateTime,
    pub source: ErrorSource,
    /// Name of the destination involved, if the failure is bound to one.
    pub destination: Option<String>,
    /// Short name of the failed operation, e.g. `"rename"` or `"enqueue"`.
    pub operation: &'static str,
    pub path: Option<PathBuf>,
    pub error: LogmuxError,
    pub context: BTreeMap<String, String>,
}

impl LogError {
    pub(crate) fn new(source: ErrorSource, operation: &'static str, error: LogmuxError) -> Self {
        Self {
            timestamp: now_local_or_utc(),
            source,
            destination: None,
            operation,
            path: None,
            error,
            context: BTreeMap::new(),
        }
    }

    pub(crate) fn with_destination(mut self, name: &str) -> Self {
        self.destination = Some(name.to_string());
        self
    }

    pub(crate) fn with_path(mut self, path: &std::path::Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub(crate) fn with_context(mut self, key: &str, value: String) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Hook invoked for every internal failure.
///
/// The hook must not re-enter logging; the default handler writes a single
/// line to the process's standard error.
pub type ErrorHandler = Arc<dyn Fn(&LogError) + Send + Sync>;

/// Runtime-replaceable handler slot shared by the background tasks.
pub(crate) type SharedErrorHandler = Arc<parking_lot::RwLock<ErrorHandler>>;

pub(crate) fn new_shared_handler(handler: ErrorHandler) -> SharedErrorHandler {
    Arc::new(parking_lot::RwLock::new(handler))
}

/// Invokes the current handler without holding the slot lock during the
/// call, so a handler may itself be replaced from inside a hook.
pub(crate) fn invoke_handler(handler: &SharedErrorHandler, event: &LogError) {
    let current = Arc::clone(&*handler.read());
    (*current)(event);
}

/// Maps an error to the source tag used in the per-source metric map.
pub(crate) fn source_of(e: &LogmuxError) -> ErrorSource {
    match e {
        LogmuxError::Closed | LogmuxError::QueueFull | LogmuxError::ShutdownTimeout => {
            ErrorSource::Queue
        }
        LogmuxError::CompressionQueueFull => ErrorSource::Compress,
        LogmuxError::FileOpen { .. } | LogmuxError::FileWrite { .. } | LogmuxError::Io(_) => {
            ErrorSource::Write
        }
        LogmuxError::FileFlush { .. } => ErrorSource::Flush,
        LogmuxError::FileRotate { .. } => ErrorSource::Rotate,
        LogmuxError::FileLock { .. } => ErrorSource::Lock,
        LogmuxError::FileClose { .. } => ErrorSource::Destination,
        LogmuxError::DestinationNotFound(_) | LogmuxError::DuplicateDestination(_) => {
            ErrorSource::Destination
        }
        LogmuxError::InvalidConfig(_) => ErrorSource::Config,
        LogmuxError::Format(_) | LogmuxError::Redaction(_) => ErrorSource::Destination,
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

pub(crate) fn default_error_handler() -> ErrorHandler {
    Arc::new(|e: &LogError| {
        let mut line = format!(
            "[logmux][{}] {} failed: {}",
            e.source.as_str(),
            e.operation,
            e.error
        );
        if let Some(ref dest) = e.destination {
            line.push_str(&format!(" (destination {})", dest));
        }
        if let Some(ref path) = e.path {
            line.push_str(&format!(" (path {})", path.display()));
        }
        eprintln!("{}", line);
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(LogmuxError::QueueFull.is_retryable());
        assert!(LogmuxError::CompressionQueueFull.is_retryable());
        assert!(LogmuxError::FileLock {
            path: PathBuf::from("a.log"),
            timeout_ms: 5000
        }
        .is_retryable());
        assert!(!LogmuxError::Closed.is_retryable());
        assert!(!LogmuxError::DuplicateDestination("x".into()).is_retryable());
    }

    #[test]
    fn retryable_platform_messages() {
        let e = LogmuxError::FileWrite {
            path: PathBuf::from("a.log"),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "write: no space left on device",
            ),
        };
        assert!(e.is_retryable());

        let e = LogmuxError::FileWrite {
            path: PathBuf::from("a.log"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "permission denied"),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn source_index_roundtrip() {
        for i in 0..ERROR_SOURCE_COUNT {
            assert_eq!(ErrorSource::from_index(i).as_index(), i);
        }
    }
}
