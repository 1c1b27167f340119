#![forbid(unsafe_code)]

//! An asynchronous multi-destination logging engine.
//!
//! Producers enqueue records on a bounded queue and return immediately; a
//! single dispatcher thread samples, filters, redacts, formats, batches and
//! fans each record out to the registered destinations. File destinations
//! rotate by size and age into lexicographically sortable timestamped
//! names, a worker pool gzips rotated files out of band, and a sweeper
//! enforces age- and count-based retention. Every counter the engine keeps
//! is visible through an atomic metrics snapshot, and every internal
//! failure is routed to a central error-handler hook. Producer calls never
//! panic and, by default, never block.
//!
//! ```ignore
//! use logmux::{Compression, Level, LoggerBuilder};
//!
//! let logger = LoggerBuilder::new()
//!     .level(Level::Info)
//!     .max_size(10 * 1024 * 1024)
//!     .max_files(5)
//!     .compression(Compression::Gzip)
//!     .add_destination("./logs/app.log")
//!     .try_build()?;
//!
//! logger.info("service started")?;
//! logger.log_with_fields(
//!     Level::Warn,
//!     "slow query",
//!     logmux::fields! { "table" => "users", "ms" => 2500i64 },
//! )?;
//! logger.close()?;
//! # Ok::<(), logmux::LogmuxError>(())
//! ```
//!
//! Writes to one destination are strictly FIFO in dispatch order; no order
//! is promised across destinations. Concurrent processes appending to the
//! same file are serialized by an advisory whole-file lock, so records
//! interleave only at line boundaries.

mod backend;
mod batch;
mod bridge;
mod cache;
mod clock;
#[cfg(feature = "compress")]
mod compress;
mod destination;
mod dispatch;
mod error;
mod filter;
mod format;
mod level;
mod logger;
mod metrics;
mod parameters;
mod record;
mod redact;
mod retain;
mod sample;
mod uri;
mod value;

pub use backend::{Backend, FileBackend};
pub use batch::BatchConfig;
pub use bridge::LogBridge;
pub use destination::{BackendFactory, DestinationInfo};
pub use error::{ErrorHandler, ErrorSource, LogError, LogmuxError};
pub use filter::{ChainMode, FilterChain, FilterFn};
pub use format::{Format, Formatter, JsonFormatter, TextFormatter};
pub use level::Level;
pub use logger::{Logger, LoggerBuilder};
pub use metrics::MetricsSnapshot;
pub use parameters::{Compression, OverflowPolicy};
pub use record::{Caller, LogRecord, Payload, StructuredEntry};
pub use redact::{FieldPathRule, Redactor};
pub use sample::{Sampling, SamplingKeyFn};
pub use uri::{DestinationUri, HostPort};
pub use value::{FieldMap, FieldValue};
