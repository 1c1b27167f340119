use std::sync::Arc;

use crate::level::Level;
use crate::logger::Logger;
use crate::record::{Caller, Payload};
use crate::LogmuxError;

/// Adapter that lets the `log` macros write through a [`Logger`].
///
/// ```ignore
/// let logger = Arc::new(Logger::to_file("./app.log")?);
/// LogBridge::install(Arc::clone(&logger))?;
/// log::info!("goes through logmux");
/// ```
pub struct LogBridge {
    logger: Arc<Logger>,
}

impl LogBridge {
    #[must_use]
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }

    /// Registers this bridge as the process-wide `log` backend.
    ///
    /// A set-once operation: registering a second `log` backend fails, per
    /// the `log` crate contract.
    pub fn install(logger: Arc<Logger>) -> Result<(), LogmuxError> {
        log::set_max_level(level_to_filter(logger.level()));
        log::set_boxed_logger(Box::new(Self::new(logger)))
            .map_err(|e| LogmuxError::InvalidConfig(e.to_string()))
    }
}

fn level_from_log(level: log::Level) -> Level {
    match level {
        log::Level::Trace => Level::Trace,
        log::Level::Debug => Level::Debug,
        log::Level::Info => Level::Info,
        log::Level::Warn => Level::Warn,
        log::Level::Error => Level::Error,
    }
}

fn level_to_filter(level: Level) -> log::LevelFilter {
    match level {
        Level::Trace => log::LevelFilter::Trace,
        Level::Debug => log::LevelFilter::Debug,
        Level::Info => log::LevelFilter::Info,
        Level::Warn => log::LevelFilter::Warn,
        Level::Error => log::LevelFilter::Error,
    }
}

impl log::Log for LogBridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        level_from_log(metadata.level()) >= self.logger.level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let caller = Caller {
            file: record.file().map(str::to_string),
            line: record.line(),
            module: record.module_path().map(str::to_string),
        };
        let payload = match record.args().as_str() {
            Some(s) => Payload::Message(s.to_string()),
            None => Payload::Message(record.args().to_string()),
        };
        // producer errors are reported through the handler; the log facade
        // offers no error channel
        self.logger
            .log_record(level_from_log(record.level()), payload, Some(caller))
            .ok();
    }

    fn flush(&self) {
        self.logger.flush_all().ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use log::Log;

    #[test]
    fn log_records_flow_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let logger = Arc::new(Logger::to_file(path.to_str().unwrap()).unwrap());
        let bridge = LogBridge::new(Arc::clone(&logger));

        bridge.log(
            &log::Record::builder()
                .args(format_args!("via the log facade"))
                .level(log::Level::Warn)
                .target("app")
                .file(Some("server.rs"))
                .line(Some(144))
                .module_path(Some("server"))
                .build(),
        );
        logger.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[WARN] via the log facade"));
    }

    #[test]
    fn facade_levels_below_threshold_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let logger = Arc::new(Logger::to_file(path.to_str().unwrap()).unwrap());
        let bridge = LogBridge::new(Arc::clone(&logger));

        assert!(!bridge.enabled(
            &log::Metadata::builder()
                .level(log::Level::Debug)
                .target("app")
                .build()
        ));
        logger.close().unwrap();
    }
}
