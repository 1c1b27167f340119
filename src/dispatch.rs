use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::backend::enforce_max_files;
#[cfg(feature = "compress")]
use crate::backend::list_rotated_files;
#[cfg(feature = "compress")]
use crate::compress::CompressionPool;
use crate::destination::Destination;
use crate::error::{
    panic_message, source_of, ErrorSource, LogError, LogmuxError, SharedErrorHandler,
};
use crate::filter::FilterChain;
use crate::format::Formatter;
use crate::metrics::Metrics;
use crate::parameters::SharedSettings;
use crate::record::{LogRecord, Payload};
use crate::redact::Redactor;
use crate::retain::RetentionSweeper;
use crate::sample::Sampler;

// Upper bound on how long a batch flush can lag behind its interval.
const DISPATCH_TICK: Duration = Duration::from_millis(100);

/// What producers put on the queue and the dispatcher takes off it.
pub(crate) enum Command {
    Record(LogRecord),
    /// Drain every batch buffer and fsync, then acknowledge.
    Flush(Sender<()>),
    /// Stop: drain until the deadline (`None` = no deadline), close
    /// everything, acknowledge through the done channel.
    Shutdown { deadline: Option<Instant> },
}

/// State shared between the facade, the dispatcher, and the background
/// tasks. The facade holds it in an `Arc`; the dispatcher thread owns the
/// queue's receiving end.
pub(crate) struct Core {
    pub level: AtomicU8,
    pub closed: AtomicBool,
    pub settings: Arc<SharedSettings>,
    pub metrics: Arc<Metrics>,
    pub handler: SharedErrorHandler,
    pub registry: RwLock<Vec<Arc<Destination>>>,
    pub sampler: RwLock<Sampler>,
    pub filters: RwLock<FilterChain>,
    pub redactor: RwLock<Option<Redactor>>,
    pub default_formatter: RwLock<Arc<dyn Formatter>>,
    #[cfg(feature = "compress")]
    pub compressor: Mutex<Option<CompressionPool>>,
    pub sweeper: Mutex<Option<RetentionSweeper>>,
    pub sweep_paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl Core {
    pub fn report(&self, event: LogError) {
        self.metrics.record_error(event.source);
        crate::error::invoke_handler(&self.handler, &event);
    }

    fn enabled_destinations(&self) -> Vec<Arc<Destination>> {
        self.registry
            .read()
            .iter()
            .filter(|d| d.is_enabled())
            .cloned()
            .collect()
    }

    fn all_destinations(&self) -> Vec<Arc<Destination>> {
        self.registry.read().clone()
    }
}

pub(crate) fn spawn_dispatcher(
    core: Arc<Core>,
    receiver: Receiver<Command>,
    done: Sender<()>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("logmux-dispatch".to_string())
        .spawn(move || {
            Dispatcher { core }.run(&receiver);
            done.send(()).ok();
        })
        .expect("spawning dispatcher failed")
}

struct Dispatcher {
    core: Arc<Core>,
}

impl Dispatcher {
    fn run(&self, receiver: &Receiver<Command>) {
        loop {
            match receiver.recv_timeout(DISPATCH_TICK) {
                Ok(Command::Record(record)) => self.process_guarded(record),
                Ok(Command::Flush(ack)) => {
                    self.flush_all();
                    ack.send(()).ok();
                }
                Ok(Command::Shutdown { deadline }) => {
                    self.drain(receiver, deadline);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => self.tick_batches(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.close_all();
    }

    // A bug in a user filter, key function, or formatter must not kill the
    // dispatcher; the caught panic goes through the error handler and the
    // record is dropped.
    fn process_guarded(&self, record: LogRecord) {
        let level = record.level();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.process(record)
        }));
        if let Err(panic) = outcome {
            self.core.metrics.record_dropped();
            self.core.report(LogError::new(
                ErrorSource::Recovery,
                "dispatch",
                LogmuxError::Format(panic_message(&panic)),
            ).with_context("level", level.as_str().to_string()));
        }
    }

    fn process(&self, mut record: LogRecord) {
        let level = record.level();
        {
            let empty = crate::value::FieldMap::new();
            let fields = record.fields().unwrap_or(&empty);
            if !self
                .core
                .sampler
                .read()
                .keep(level, record.message(), fields)
            {
                self.core.metrics.record_sampled_out();
                return;
            }
            if !self
                .core
                .filters
                .read()
                .keep(level, record.message(), fields)
            {
                self.core.metrics.record_filtered();
                return;
            }
        }

        if let Some(redactor) = self.core.redactor.read().as_ref() {
            apply_redaction(redactor, &mut record);
        }

        let destinations = self.core.enabled_destinations();
        if destinations.is_empty() {
            self.core.metrics.record_dropped();
            return;
        }

        // destinations sharing a formatter instance share the buffer
        let mut formatted: Vec<(usize, Vec<u8>)> = Vec::with_capacity(destinations.len());
        let mut accepted = 0usize;
        for dest in &destinations {
            let formatter = dest.formatter();
            let key = Arc::as_ptr(&formatter) as *const () as usize;
            let buf_idx = match formatted.iter().position(|(k, _)| *k == key) {
                Some(idx) => idx,
                None => {
                    let mut buf = Vec::with_capacity(128);
                    if let Err(e) = formatter.format(&mut buf, &record) {
                        // write the record anyway, minus the failing
                        // transformation
                        buf.clear();
                        buf.extend_from_slice(record.message().as_bytes());
                        buf.push(b'\n');
                        self.core.report(
                            LogError::new(
                                ErrorSource::Destination,
                                "format",
                                LogmuxError::Format(e.to_string()),
                            )
                            .with_destination(dest.name()),
                        );
                    }
                    formatted.push((key, buf));
                    formatted.len() - 1
                }
            };

            let bytes = &formatted[buf_idx].1;
            match dest.append(bytes, &self.core.settings, &self.core.metrics) {
                Ok(rotated) => {
                    accepted += 1;
                    if rotated.is_some() {
                        self.after_rotation(dest);
                    }
                }
                Err(error) => {
                    dest.counters().errors.fetch_add(1, Ordering::Relaxed);
                    let source = source_of(&error);
                    self.core.report(
                        LogError::new(source, "append", error)
                            .with_destination(dest.name()),
                    );
                }
            }
        }

        if accepted > 0 {
            self.core.metrics.record_logged(level);
        } else {
            // the record reached no sink at all
            self.core.metrics.record_dropped();
        }
    }

    fn after_rotation(&self, dest: &Arc<Destination>) {
        let base = match dest.file_path() {
            Some(p) => p,
            None => return,
        };

        #[cfg(feature = "compress")]
        self.queue_compression(dest, &base);

        let max_files = self.core.settings.max_files();
        if max_files > 0 {
            for _removed in enforce_max_files(&base, max_files) {
                self.core.metrics.record_retention_removal();
            }
        }
        if self.core.settings.max_age().is_some() {
            if let Some(sweeper) = self.core.sweeper.lock().as_ref() {
                sweeper.request_sweep();
            }
        }
    }

    #[cfg(feature = "compress")]
    fn queue_compression(&self, dest: &Arc<Destination>, base: &std::path::Path) {
        if !self.core.settings.compression().is_enabled() {
            return;
        }
        let min_age = self.core.settings.compress_min_age();
        let (files, skipped) = list_rotated_files(base);
        for foreign in skipped {
            self.core.report(
                LogError::new(
                    ErrorSource::Rotate,
                    "list",
                    LogmuxError::InvalidConfig(
                        "rotated sibling with unparsable timestamp skipped".to_string(),
                    ),
                )
                .with_destination(dest.name())
                .with_path(&foreign),
            );
        }
        let compressor = self.core.compressor.lock();
        let compressor = match compressor.as_ref() {
            Some(c) => c,
            None => return,
        };
        for candidate in files
            .iter()
            .enumerate()
            .filter(|(idx, f)| *idx >= min_age && !f.compressed)
        {
            // full queue leaves the file for the next rotation to retry
            if let Err(error) = compressor.try_enqueue(candidate.1.path.clone()) {
                self.core.report(
                    LogError::new(ErrorSource::Compress, "enqueue", error)
                        .with_destination(dest.name())
                        .with_path(&candidate.1.path),
                );
                break;
            }
        }
    }

    fn tick_batches(&self) {
        for dest in self.core.enabled_destinations() {
            if let Err(error) = dest.tick(&self.core.metrics) {
                dest.counters().errors.fetch_add(1, Ordering::Relaxed);
                let source = source_of(&error);
                self.core.report(
                    LogError::new(source, "tick", error).with_destination(dest.name()),
                );
            }
        }
    }

    fn flush_all(&self) {
        for dest in self.core.all_destinations() {
            if let Err(error) = dest.flush(&self.core.metrics) {
                dest.counters().errors.fetch_add(1, Ordering::Relaxed);
                self.core.report(
                    LogError::new(ErrorSource::Flush, "flush", error)
                        .with_destination(dest.name()),
                );
            }
        }
    }

    // Drains queued records until the queue is empty or the deadline
    // passes; anything still queued afterwards counts as dropped.
    fn drain(&self, receiver: &Receiver<Command>, deadline: Option<Instant>) {
        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let mut remaining = 0u64;
                    while let Ok(cmd) = receiver.try_recv() {
                        match cmd {
                            Command::Record(_) => remaining += 1,
                            Command::Flush(ack) => {
                                ack.send(()).ok();
                            }
                            Command::Shutdown { .. } => {}
                        }
                    }
                    if remaining > 0 {
                        self.core.metrics.record_dropped_n(remaining);
                        self.core.report(LogError::new(
                            ErrorSource::Queue,
                            "drain",
                            LogmuxError::ShutdownTimeout,
                        ));
                    }
                    return;
                }
            }
            match receiver.try_recv() {
                Ok(Command::Record(record)) => self.process_guarded(record),
                Ok(Command::Flush(ack)) => {
                    self.flush_all();
                    ack.send(()).ok();
                }
                Ok(Command::Shutdown { .. }) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    // Final teardown: flush and close every destination, stop the
    // compression workers (they finish queued jobs first), stop the
    // sweeper, and empty the registry.
    fn close_all(&self) {
        for dest in self.core.all_destinations() {
            if let Err(error) = dest.close(&self.core.metrics) {
                self.core.report(
                    LogError::new(ErrorSource::Destination, "close", error)
                        .with_destination(dest.name()),
                );
            }
        }
        #[cfg(feature = "compress")]
        if let Some(mut compressor) = self.core.compressor.lock().take() {
            compressor.shutdown();
        }
        if let Some(mut sweeper) = self.core.sweeper.lock().take() {
            sweeper.shutdown();
        }
        self.core.registry.write().clear();
        self.core.sweep_paths.lock().clear();
    }
}

fn apply_redaction(redactor: &Redactor, record: &mut LogRecord) {
    match &mut record.payload {
        Payload::Message(message) => {
            let redacted = redactor.redact(message);
            if redacted != *message {
                *message = redacted;
            }
        }
        Payload::Structured(entry) => {
            let redacted = redactor.redact(&entry.message);
            if redacted != entry.message {
                entry.message = redacted;
            }
            redactor.redact_fields(&mut entry.fields);
        }
        Payload::Raw(_) => {}
    }
}
