#![cfg(feature = "compress")]

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{invoke_handler, ErrorSource, LogError, SharedErrorHandler};
use crate::metrics::Metrics;
use crate::LogmuxError;

/// Out-of-band gzip of rotated files.
///
/// A bounded work channel feeds `N` workers; enqueueing never blocks the
/// write path, and compression failures never affect logging. Stopping is
/// by dropping the sender and joining the workers.
pub(crate) struct CompressionPool {
    sender: Option<Sender<PathBuf>>,
    workers: Vec<JoinHandle<()>>,
}

impl CompressionPool {
    pub fn new(
        capacity: usize,
        worker_count: usize,
        metrics: Arc<Metrics>,
        handler: SharedErrorHandler,
    ) -> Self {
        let (sender, receiver) = bounded::<PathBuf>(capacity.max(1));
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for i in 0..worker_count.max(1) {
            let receiver: Receiver<PathBuf> = receiver.clone();
            let metrics = Arc::clone(&metrics);
            let handler = Arc::clone(&handler);
            let builder =
                std::thread::Builder::new().name(format!("logmux-compress-{}", i));
            let join_handle = builder
                .spawn(move || worker_loop(&receiver, &metrics, &handler))
                .expect("spawning compression worker failed");
            workers.push(join_handle);
        }
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queues a rotated file; a full queue leaves the file uncompressed.
    pub fn try_enqueue(&self, path: PathBuf) -> Result<(), LogmuxError> {
        let sender = self.sender.as_ref().ok_or(LogmuxError::Closed)?;
        match sender.try_send(path) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LogmuxError::CompressionQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(LogmuxError::Closed),
        }
    }

    /// Closes the work channel and waits for in-flight jobs.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}

impl Drop for CompressionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Receiver<PathBuf>, metrics: &Metrics, handler: &SharedErrorHandler) {
    while let Ok(path) = receiver.recv() {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            compress_file(&path)
        }));
        match outcome {
            Ok(Ok(())) => metrics.record_compression(),
            Ok(Err(error)) => {
                metrics.record_error(ErrorSource::Compress);
                let event = LogError::new(ErrorSource::Compress, "gzip", error).with_path(&path);
                invoke_handler(handler, &event);
            }
            Err(panic) => {
                metrics.record_error(ErrorSource::Recovery);
                let event = LogError::new(
                    ErrorSource::Recovery,
                    "gzip",
                    LogmuxError::Format(crate::error::panic_message(&panic)),
                )
                .with_path(&path);
                invoke_handler(handler, &event);
            }
        }
    }
}

// Streams `path` into `path.gz` and removes the original. Any failure
// removes the partial `.gz` so a retry can use exclusive create again.
fn compress_file(path: &std::path::Path) -> Result<(), LogmuxError> {
    let mut gz_path = path.as_os_str().to_os_string();
    gz_path.push(".gz");
    let gz_path = PathBuf::from(gz_path);

    let result = (|| -> Result<(), LogmuxError> {
        let mut source = File::open(path).map_err(|source| LogmuxError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let target = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&gz_path)
            .map_err(|source| LogmuxError::FileOpen {
                path: gz_path.clone(),
                source,
            })?;
        let mut encoder = flate2::write::GzEncoder::new(target, flate2::Compression::default());
        std::io::copy(&mut source, &mut encoder).map_err(|source| LogmuxError::FileWrite {
            path: gz_path.clone(),
            source,
        })?;
        encoder.finish().map_err(|source| LogmuxError::FileClose {
            path: gz_path.clone(),
            source,
        })?;
        std::fs::remove_file(path).map_err(|source| LogmuxError::FileClose {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    })();

    if result.is_err() {
        std::fs::remove_file(&gz_path).ok();
    }
    result
}
