use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, SendTimeoutError, TrySendError};
use parking_lot::{Mutex, RwLock};
use time::UtcOffset;

use crate::batch::BatchConfig;
#[cfg(feature = "compress")]
use crate::compress::CompressionPool;
use crate::clock::{now_in_zone, now_local_or_utc};
use crate::destination::{BackendFactory, Destination, DestinationInfo};
use crate::dispatch::{spawn_dispatcher, Command, Core};
use crate::error::{
    default_error_handler, new_shared_handler, ErrorHandler, ErrorSource, LogError,
};
use crate::filter::{FilterChain, FilterFn};
use crate::format::{Format, Formatter, JsonFormatter, TextFormatter};
use crate::level::Level;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::parameters::{
    Compression, OverflowPolicy, SharedSettings, DEFAULT_COMPRESSION_QUEUE_CAPACITY,
    DEFAULT_COMPRESSION_WORKERS, DEFAULT_FILE_LOCK_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
    MIN_SWEEP_INTERVAL,
};
use crate::record::{Caller, LogRecord, Payload, StructuredEntry};
use crate::redact::Redactor;
use crate::retain::RetentionSweeper;
use crate::sample::{Sampler, Sampling};
use crate::value::FieldMap;
use crate::LogmuxError;

/// Configures and starts a [`Logger`].
///
/// ```ignore
/// let logger = LoggerBuilder::new()
///     .level(Level::Info)
///     .max_size(10 * 1024 * 1024)
///     .max_files(5)
///     .compression(Compression::Gzip)
///     .add_destination("./app.log")
///     .try_build()?;
/// ```
pub struct LoggerBuilder {
    cfg_level: Level,
    cfg_queue_capacity: usize,
    cfg_overflow: OverflowPolicy,
    cfg_format: Format,
    cfg_batch: Option<BatchConfig>,
    cfg_max_size: u64,
    cfg_max_files: usize,
    cfg_max_age: Option<Duration>,
    cfg_compression: Compression,
    cfg_compress_min_age: usize,
    cfg_compression_queue_capacity: usize,
    cfg_compression_workers: usize,
    cfg_lock_timeout: Duration,
    cfg_sweep_interval: Duration,
    cfg_timezone: Option<UtcOffset>,
    cfg_sampling: Sampling,
    cfg_filters: FilterChain,
    cfg_redactor: Option<Redactor>,
    cfg_error_handler: ErrorHandler,
    cfg_factories: HashMap<String, BackendFactory>,
    cfg_destinations: Vec<String>,
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg_level: Level::Info,
            cfg_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cfg_overflow: OverflowPolicy::DropNewest,
            cfg_format: Format::Text,
            cfg_batch: None,
            cfg_max_size: 0,
            cfg_max_files: 0,
            cfg_max_age: None,
            cfg_compression: Compression::None,
            cfg_compress_min_age: 0,
            cfg_compression_queue_capacity: DEFAULT_COMPRESSION_QUEUE_CAPACITY,
            cfg_compression_workers: DEFAULT_COMPRESSION_WORKERS,
            cfg_lock_timeout: DEFAULT_FILE_LOCK_TIMEOUT,
            cfg_sweep_interval: MIN_SWEEP_INTERVAL,
            cfg_timezone: None,
            cfg_sampling: Sampling::None,
            cfg_filters: FilterChain::default(),
            cfg_redactor: None,
            cfg_error_handler: default_error_handler(),
            cfg_factories: HashMap::new(),
            cfg_destinations: Vec::new(),
        }
    }

    #[must_use]
    pub fn level(mut self, level: Level) -> Self {
        self.cfg_level = level;
        self
    }

    /// Capacity of the bounded record queue.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.cfg_queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.cfg_overflow = policy;
        self
    }

    /// Default record format for destinations added later.
    #[must_use]
    pub fn format(mut self, format: Format) -> Self {
        self.cfg_format = format;
        self
    }

    /// Enables per-destination batching with the given thresholds.
    ///
    /// Without this, every record goes to the backend in its own write.
    #[must_use]
    pub fn batch(mut self, config: BatchConfig) -> Self {
        self.cfg_batch = Some(config);
        self
    }

    /// Rotate a destination file before it would exceed `bytes`
    /// (0 = never rotate by size).
    #[must_use]
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.cfg_max_size = bytes;
        self
    }

    /// Keep at most `count` rotated files per destination
    /// (0 = keep all).
    #[must_use]
    pub fn max_files(mut self, count: usize) -> Self {
        self.cfg_max_files = count;
        self
    }

    /// Rotate live files older than `age` and delete rotated files older
    /// than `age`.
    #[must_use]
    pub fn max_age(mut self, age: Duration) -> Self {
        self.cfg_max_age = Some(age);
        self
    }

    #[must_use]
    pub fn compression(mut self, kind: Compression) -> Self {
        self.cfg_compression = kind;
        self
    }

    /// Leave the newest `index` rotated files uncompressed.
    #[must_use]
    pub fn compress_min_age(mut self, index: usize) -> Self {
        self.cfg_compress_min_age = index;
        self
    }

    #[must_use]
    pub fn compression_workers(mut self, workers: usize) -> Self {
        self.cfg_compression_workers = workers.max(1);
        self
    }

    /// Timeout for acquiring the advisory file lock.
    #[must_use]
    pub fn file_lock_timeout(mut self, timeout: Duration) -> Self {
        self.cfg_lock_timeout = timeout;
        self
    }

    /// Interval of the retention sweeper; clamped to one minute minimum.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.cfg_sweep_interval = interval;
        self
    }

    /// Time zone for record timestamps; defaults to the local offset.
    #[must_use]
    pub fn timezone(mut self, offset: UtcOffset) -> Self {
        self.cfg_timezone = Some(offset);
        self
    }

    #[must_use]
    pub fn sampling(mut self, strategy: Sampling) -> Self {
        self.cfg_sampling = strategy;
        self
    }

    #[must_use]
    pub fn filters(mut self, chain: FilterChain) -> Self {
        self.cfg_filters = chain;
        self
    }

    #[must_use]
    pub fn redactor(mut self, redactor: Redactor) -> Self {
        self.cfg_redactor = Some(redactor);
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.cfg_error_handler = handler;
        self
    }

    /// Registers a backend factory for a URI scheme (e.g. `syslog`).
    #[must_use]
    pub fn register_scheme(mut self, scheme: &str, factory: BackendFactory) -> Self {
        self.cfg_factories
            .insert(scheme.to_ascii_lowercase(), factory);
        self
    }

    /// Queues a destination URI to be opened by `try_build`.
    #[must_use]
    pub fn add_destination(mut self, uri: &str) -> Self {
        self.cfg_destinations.push(uri.to_string());
        self
    }

    /// Starts the dispatcher, the compression pool, and the sweeper, and
    /// opens the queued destinations.
    ///
    /// # Errors
    ///
    /// `LogmuxError::InvalidConfig` for a bad URI or unregistered scheme,
    /// `LogmuxError::DuplicateDestination`, or any `FileOpen` fault.
    pub fn try_build(self) -> Result<Logger, LogmuxError> {
        let settings = Arc::new(SharedSettings::new(
            self.cfg_max_size,
            self.cfg_max_files,
            self.cfg_max_age,
            self.cfg_compression,
            self.cfg_compress_min_age,
            self.cfg_lock_timeout,
        ));
        let metrics = Arc::new(Metrics::new());
        let handler = new_shared_handler(self.cfg_error_handler);
        let sweep_paths = Arc::new(Mutex::new(Vec::new()));

        #[cfg(feature = "compress")]
        let compressor = CompressionPool::new(
            self.cfg_compression_queue_capacity,
            self.cfg_compression_workers,
            Arc::clone(&metrics),
            Arc::clone(&handler),
        );
        let sweeper = RetentionSweeper::start(
            self.cfg_sweep_interval,
            Arc::clone(&sweep_paths),
            Arc::clone(&settings),
            Arc::clone(&metrics),
            Arc::clone(&handler),
        );

        let seed = now_local_or_utc().unix_timestamp_nanos() as u64;
        let core = Arc::new(Core {
            level: AtomicU8::new(self.cfg_level as u8),
            closed: AtomicBool::new(false),
            settings,
            metrics,
            handler,
            registry: RwLock::new(Vec::new()),
            sampler: RwLock::new(Sampler::new(self.cfg_sampling, seed)),
            filters: RwLock::new(self.cfg_filters),
            redactor: RwLock::new(self.cfg_redactor),
            default_formatter: RwLock::new(make_formatter(self.cfg_format)),
            #[cfg(feature = "compress")]
            compressor: Mutex::new(Some(compressor)),
            sweeper: Mutex::new(Some(sweeper)),
            sweep_paths,
        });

        let (sender, receiver) = bounded(self.cfg_queue_capacity);
        let (done_tx, done_rx) = bounded(1);
        let dispatcher = spawn_dispatcher(Arc::clone(&core), receiver, done_tx);

        let logger = Logger {
            core,
            sender,
            overflow: self.cfg_overflow,
            timezone: self.cfg_timezone,
            batch_default: RwLock::new(self.cfg_batch),
            factories: self.cfg_factories,
            dispatcher: Mutex::new(Some(dispatcher)),
            done_rx: Mutex::new(done_rx),
        };
        for uri in &self.cfg_destinations {
            match logger.add_destination(uri) {
                Ok(_) => {}
                Err(e) => {
                    logger.close().ok();
                    return Err(e);
                }
            }
        }
        Ok(logger)
    }
}

fn make_formatter(format: Format) -> Arc<dyn Formatter> {
    match format {
        Format::Text => Arc::new(TextFormatter::new()),
        Format::Json => Arc::new(JsonFormatter::new()),
    }
}

/// The producer-facing handle of the logging engine.
///
/// Cloneless by design: share it behind an `Arc` (every method takes
/// `&self`). Producer calls never block unless the overflow policy says so,
/// and never panic; internal failures surface through the error handler and
/// the metrics.
pub struct Logger {
    core: Arc<Core>,
    sender: Sender<Command>,
    overflow: OverflowPolicy,
    timezone: Option<UtcOffset>,
    batch_default: RwLock<Option<BatchConfig>>,
    factories: HashMap<String, BackendFactory>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
    done_rx: Mutex<Receiver<()>>,
}

impl Logger {
    /// Shorthand for a text logger with a single file destination.
    pub fn to_file(path: &str) -> Result<Self, LogmuxError> {
        LoggerBuilder::new().add_destination(path).try_build()
    }

    // ---- producing ----------------------------------------------------

    /// Logs a formatted message.
    ///
    /// ```ignore
    /// logger.log(Level::Warn, format_args!("retry {} of {}", n, max))?;
    /// ```
    pub fn log(&self, level: Level, args: std::fmt::Arguments) -> Result<(), LogmuxError> {
        if !self.passes_gate(level) {
            return Ok(());
        }
        let payload = match args.as_str() {
            Some(s) => Payload::Message(s.to_string()),
            None => Payload::Message(args.to_string()),
        };
        self.enqueue(LogRecord::new(level, payload, self.now()))
    }

    /// Logs a message with structured fields.
    pub fn log_with_fields(
        &self,
        level: Level,
        message: &str,
        fields: FieldMap,
    ) -> Result<(), LogmuxError> {
        if !self.passes_gate(level) {
            return Ok(());
        }
        let payload = Payload::Structured(StructuredEntry {
            message: message.to_string(),
            fields,
            stack_trace: None,
            metadata: None,
        });
        self.enqueue(LogRecord::new(level, payload, self.now()))
    }

    /// Logs pre-rendered bytes, bypassing formatting.
    pub fn log_bytes(&self, level: Level, raw: Vec<u8>) -> Result<(), LogmuxError> {
        if !self.passes_gate(level) {
            return Ok(());
        }
        self.enqueue(LogRecord::new(level, Payload::Raw(raw), self.now()))
    }

    pub fn trace(&self, message: &str) -> Result<(), LogmuxError> {
        self.log(Level::Trace, format_args!("{}", message))
    }

    pub fn debug(&self, message: &str) -> Result<(), LogmuxError> {
        self.log(Level::Debug, format_args!("{}", message))
    }

    pub fn info(&self, message: &str) -> Result<(), LogmuxError> {
        self.log(Level::Info, format_args!("{}", message))
    }

    pub fn warn(&self, message: &str) -> Result<(), LogmuxError> {
        self.log(Level::Warn, format_args!("{}", message))
    }

    pub fn error(&self, message: &str) -> Result<(), LogmuxError> {
        self.log(Level::Error, format_args!("{}", message))
    }

    pub(crate) fn log_record(
        &self,
        level: Level,
        payload: Payload,
        caller: Option<Caller>,
    ) -> Result<(), LogmuxError> {
        if !self.passes_gate(level) {
            return Ok(());
        }
        let mut record = LogRecord::new(level, payload, self.now());
        if let Some(caller) = caller {
            record = record.with_caller(caller);
        }
        self.enqueue(record)
    }

    // The level gate runs before any allocation; sub-threshold records are
    // discarded without counting as dropped.
    #[inline]
    fn passes_gate(&self, level: Level) -> bool {
        level as u8 >= self.core.level.load(Ordering::Relaxed)
    }

    fn now(&self) -> time::OffsetDateTime {
        now_in_zone(self.timezone)
    }

    fn enqueue(&self, record: LogRecord) -> Result<(), LogmuxError> {
        if self.core.closed.load(Ordering::Relaxed) {
            return Err(LogmuxError::Closed);
        }
        match self.overflow {
            OverflowPolicy::DropNewest => {
                match self.sender.try_send(Command::Record(record)) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        self.core.metrics.record_dropped();
                        self.core.report(LogError::new(
                            ErrorSource::Queue,
                            "enqueue",
                            LogmuxError::QueueFull,
                        ));
                        Err(LogmuxError::QueueFull)
                    }
                    Err(TrySendError::Disconnected(_)) => Err(LogmuxError::Closed),
                }
            }
            OverflowPolicy::Block(None) => self
                .sender
                .send(Command::Record(record))
                .map_err(|_| LogmuxError::Closed),
            OverflowPolicy::Block(Some(timeout)) => {
                match self.sender.send_timeout(Command::Record(record), timeout) {
                    Ok(()) => Ok(()),
                    Err(SendTimeoutError::Timeout(_)) => {
                        self.core.metrics.record_dropped();
                        self.core.report(LogError::new(
                            ErrorSource::Queue,
                            "enqueue",
                            LogmuxError::QueueFull,
                        ));
                        Err(LogmuxError::QueueFull)
                    }
                    Err(SendTimeoutError::Disconnected(_)) => Err(LogmuxError::Closed),
                }
            }
        }
    }

    // ---- runtime configuration ----------------------------------------

    pub fn level(&self) -> Level {
        Level::from_u8(self.core.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: Level) {
        self.core.level.store(level as u8, Ordering::Relaxed);
    }

    /// Switches every destination (and the default for new ones) to the
    /// given built-in format.
    pub fn set_format(&self, format: Format) {
        let formatter = make_formatter(format);
        *self.core.default_formatter.write() = Arc::clone(&formatter);
        for dest in self.core.registry.read().iter() {
            dest.set_formatter(Arc::clone(&formatter));
        }
    }

    /// Switches every destination to the given formatter instance.
    pub fn set_formatter(&self, formatter: Arc<dyn Formatter>) {
        *self.core.default_formatter.write() = Arc::clone(&formatter);
        for dest in self.core.registry.read().iter() {
            dest.set_formatter(Arc::clone(&formatter));
        }
    }

    pub fn set_max_size(&self, bytes: u64) {
        self.core.settings.set_max_size(bytes);
    }

    pub fn set_max_files(&self, count: usize) {
        self.core.settings.set_max_files(count);
    }

    pub fn set_max_age(&self, age: Option<Duration>) {
        self.core.settings.set_max_age(age);
    }

    pub fn set_compression(&self, kind: Compression) {
        self.core.settings.set_compression(kind);
    }

    pub fn set_sampling(&self, strategy: Sampling) {
        self.core.sampler.write().set_strategy(strategy);
    }

    /// Appends a filter to the chain with priority 0.
    pub fn add_filter(&self, name: &str, filter: FilterFn) {
        self.core.filters.write().add(name, filter);
    }

    pub fn remove_filter(&self, name: &str) -> bool {
        self.core.filters.write().remove(name)
    }

    /// Replaces the whole filter chain.
    pub fn set_filter_chain(&self, chain: FilterChain) {
        *self.core.filters.write() = chain;
    }

    /// Installs redaction patterns with the given replacement string.
    pub fn set_redaction(&self, patterns: &[&str], replacement: &str) -> Result<(), LogmuxError> {
        let redactor = Redactor::new(patterns, replacement)?;
        *self.core.redactor.write() = Some(redactor);
        Ok(())
    }

    /// Installs a fully configured redactor (e.g. with field-path rules).
    pub fn set_redactor(&self, redactor: Option<Redactor>) {
        *self.core.redactor.write() = redactor;
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.core.handler.write() = handler;
    }

    // ---- destinations -------------------------------------------------

    /// Opens a destination from a URI or bare path and returns its name.
    ///
    /// # Errors
    ///
    /// `DuplicateDestination` when the name or file path is already
    /// registered; `InvalidConfig` for unknown schemes or URIs the backend
    /// rejects.
    pub fn add_destination(&self, uri: &str) -> Result<String, LogmuxError> {
        if self.core.closed.load(Ordering::Relaxed) {
            return Err(LogmuxError::Closed);
        }
        let parsed = crate::uri::DestinationUri::parse(uri)?;
        let name = parsed.name();
        let formatter = Arc::clone(&self.core.default_formatter.read());
        let batch = self.batch_default.read().clone();

        let destination = if parsed.scheme == "file" {
            if !parsed.params.is_empty() {
                return Err(LogmuxError::InvalidConfig(format!(
                    "file destinations take no query parameters: {}",
                    uri
                )));
            }
            if !parsed.hosts.is_empty() {
                return Err(LogmuxError::InvalidConfig(format!(
                    "file destinations take no host: {}",
                    uri
                )));
            }
            let path = parsed.path.as_deref().ok_or_else(|| {
                LogmuxError::InvalidConfig(format!("file destination without a path: {}", uri))
            })?;
            Destination::open_file(
                name.clone(),
                Path::new(path),
                formatter,
                batch,
                self.core.settings.lock_timeout(),
            )?
        } else {
            let factory = self.factories.get(&parsed.scheme).ok_or_else(|| {
                LogmuxError::InvalidConfig(format!(
                    "no backend registered for scheme {:?}",
                    parsed.scheme
                ))
            })?;
            let backend = factory(&parsed)?;
            Destination::open_custom(name.clone(), parsed.scheme.clone(), backend, formatter, batch)
        };
        let destination = Arc::new(destination);

        let mut registry = self.core.registry.write();
        if registry.iter().any(|d| d.name() == name) {
            return Err(LogmuxError::DuplicateDestination(name));
        }
        if let Some(ref path) = destination.file_path() {
            let canonical = canonical_or_owned(path);
            for existing in registry.iter() {
                if let Some(other) = existing.file_path() {
                    if canonical_or_owned(&other) == canonical {
                        return Err(LogmuxError::DuplicateDestination(name));
                    }
                }
            }
            self.core.sweep_paths.lock().push(path.clone());
        }
        registry.push(destination);
        Ok(name)
    }

    pub fn remove_destination(&self, name: &str) -> Result<(), LogmuxError> {
        let removed = {
            let mut registry = self.core.registry.write();
            match registry.iter().position(|d| d.name() == name) {
                Some(idx) => registry.remove(idx),
                None => return Err(LogmuxError::DestinationNotFound(name.to_string())),
            }
        };
        if let Some(path) = removed.file_path() {
            self.core.sweep_paths.lock().retain(|p| *p != path);
        }
        removed.close(&self.core.metrics)?;
        Ok(())
    }

    pub fn enable_destination(&self, name: &str) -> Result<(), LogmuxError> {
        self.set_destination_enabled(name, true)
    }

    pub fn disable_destination(&self, name: &str) -> Result<(), LogmuxError> {
        self.set_destination_enabled(name, false)
    }

    fn set_destination_enabled(&self, name: &str, enabled: bool) -> Result<(), LogmuxError> {
        let registry = self.core.registry.read();
        match registry.iter().find(|d| d.name() == name) {
            Some(dest) => {
                dest.set_enabled(enabled);
                Ok(())
            }
            None => Err(LogmuxError::DestinationNotFound(name.to_string())),
        }
    }

    pub fn list_destinations(&self) -> Vec<DestinationInfo> {
        self.core.registry.read().iter().map(|d| d.info()).collect()
    }

    // ---- flushing and shutdown ----------------------------------------

    /// Blocks until every record enqueued before this call has been written
    /// and every destination buffer has reached the OS.
    pub fn flush_all(&self) -> Result<(), LogmuxError> {
        if self.core.closed.load(Ordering::Relaxed) {
            return Err(LogmuxError::Closed);
        }
        let (ack_tx, ack_rx) = bounded(1);
        self.sender
            .send(Command::Flush(ack_tx))
            .map_err(|_| LogmuxError::Closed)?;
        ack_rx.recv().map_err(|_| LogmuxError::Closed)
    }

    /// Stops accepting records, drains the queue completely, closes every
    /// destination and worker. Waits as long as that takes. Idempotent.
    pub fn close(&self) -> Result<(), LogmuxError> {
        self.stop(None);
        self.done_rx.lock().recv().ok();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.join().ok();
        }
        Ok(())
    }

    /// Like [`close`](Self::close), but gives the drain at most `timeout`.
    ///
    /// On timeout, records still queued are counted as dropped and
    /// `ShutdownTimeout` is returned; the teardown still completes in the
    /// background.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), LogmuxError> {
        let deadline = Instant::now() + timeout;
        self.stop(Some(deadline));
        match self.done_rx.lock().recv_deadline(deadline) {
            Ok(()) => {
                if let Some(handle) = self.dispatcher.lock().take() {
                    handle.join().ok();
                }
                Ok(())
            }
            Err(_) => {
                if self.dispatcher.lock().is_some() {
                    Err(LogmuxError::ShutdownTimeout)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn stop(&self, deadline: Option<Instant>) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return; // already stopping
        }
        self.sender.send(Command::Shutdown { deadline }).ok();
    }

    // ---- observation --------------------------------------------------

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.core.metrics.reset();
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if !self.core.closed.load(Ordering::Relaxed) {
            self.shutdown(Duration::from_secs(5)).ok();
        }
    }
}

fn canonical_or_owned(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
