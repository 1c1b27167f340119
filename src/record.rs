use std::time::Instant;

use time::OffsetDateTime;

use crate::level::Level;
use crate::value::FieldMap;

/// Source location of the producing call site.
#[derive(Clone, Debug)]
pub struct Caller {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub module: Option<String>,
}

/// The content of a record: a plain message, pre-rendered bytes, or a
/// structured entry.
#[derive(Clone, Debug)]
pub enum Payload {
    Message(String),
    /// Bytes written verbatim (a trailing newline is still appended by the
    /// formatter if missing).
    Raw(Vec<u8>),
    Structured(StructuredEntry),
}

#[derive(Clone, Debug)]
pub struct StructuredEntry {
    pub message: String,
    pub fields: FieldMap,
    pub stack_trace: Option<String>,
    pub metadata: Option<FieldMap>,
}

/// One log event, immutable after enqueue.
///
/// Created by the facade, consumed by the dispatcher, dropped after the last
/// destination has accepted its bytes.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub(crate) enqueued: Instant,
    pub(crate) timestamp: OffsetDateTime,
    pub(crate) level: Level,
    pub(crate) payload: Payload,
    pub(crate) caller: Option<Caller>,
}

impl LogRecord {
    pub(crate) fn new(level: Level, payload: Payload, timestamp: OffsetDateTime) -> Self {
        Self {
            enqueued: Instant::now(),
            timestamp,
            level,
            payload,
            caller: None,
        }
    }

    pub(crate) fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = Some(caller);
        self
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn caller(&self) -> Option<&Caller> {
        self.caller.as_ref()
    }

    /// The message text, or an empty string for raw-byte records.
    #[must_use]
    pub fn message(&self) -> &str {
        match &self.payload {
            Payload::Message(m) => m,
            Payload::Structured(e) => &e.message,
            Payload::Raw(_) => "",
        }
    }

    /// The structured fields, if this is a structured record.
    #[must_use]
    pub fn fields(&self) -> Option<&FieldMap> {
        match &self.payload {
            Payload::Structured(e) => Some(&e.fields),
            _ => None,
        }
    }

    /// How long ago this record was enqueued, on the monotonic clock.
    #[must_use]
    pub fn queue_age(&self) -> std::time::Duration {
        self.enqueued.elapsed()
    }
}
