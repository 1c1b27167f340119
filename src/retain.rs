use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::enforce_max_age;
use crate::error::{invoke_handler, panic_message, ErrorSource, LogError, SharedErrorHandler};
use crate::metrics::Metrics;
use crate::parameters::{SharedSettings, MIN_SWEEP_INTERVAL};
use crate::LogmuxError;

enum MessageToSweeper {
    Sweep,
    Die,
}

/// Ticker-driven deletion of rotated files that outlived `max_age`.
///
/// Runs in a background thread; each registered base path is swept inside
/// its own panic guard so one bad path cannot stop the ticker. A sweep can
/// also be requested out of band, which rotation does.
pub(crate) struct RetentionSweeper {
    sender: std::sync::mpsc::Sender<MessageToSweeper>,
    join_handle: Option<JoinHandle<()>>,
}

impl RetentionSweeper {
    pub fn start(
        interval: Duration,
        base_paths: Arc<Mutex<Vec<PathBuf>>>,
        settings: Arc<SharedSettings>,
        metrics: Arc<Metrics>,
        handler: SharedErrorHandler,
    ) -> Self {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let (sender, receiver) = std::sync::mpsc::channel();
        let builder = std::thread::Builder::new().name("logmux-sweeper".to_string());
        let join_handle = builder
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Ok(MessageToSweeper::Sweep)
                    | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        sweep_all(&base_paths, &settings, &metrics, &handler);
                    }
                    Ok(MessageToSweeper::Die)
                    | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("spawning retention sweeper failed");
        Self {
            sender,
            join_handle: Some(join_handle),
        }
    }

    /// Requests an immediate sweep without waiting for the next tick.
    pub fn request_sweep(&self) {
        self.sender.send(MessageToSweeper::Sweep).ok();
    }

    pub fn shutdown(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.sender.send(MessageToSweeper::Die).ok();
            join_handle.join().ok();
        }
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_all(
    base_paths: &Mutex<Vec<PathBuf>>,
    settings: &SharedSettings,
    metrics: &Metrics,
    handler: &SharedErrorHandler,
) {
    let max_age = match settings.max_age() {
        Some(age) => age,
        None => return,
    };
    let paths = base_paths.lock().clone();
    for path in paths {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for _removed in enforce_max_age(&path, max_age) {
                metrics.record_retention_removal();
            }
        }));
        if let Err(panic) = outcome {
            metrics.record_error(ErrorSource::Recovery);
            let event = LogError::new(
                ErrorSource::Recovery,
                "sweep",
                LogmuxError::Format(panic_message(&panic)),
            )
            .with_path(&path);
            invoke_handler(handler, &event);
        }
    }
}
