use std::io;

use serde::ser::{Serialize, SerializeMap, Serializer};
use time::format_description::well_known::Rfc3339;
use time::format_description::OwnedFormatItem;

use crate::record::{LogRecord, Payload, StructuredEntry};
use crate::value::{BoundedJson, BoundedJsonMap};
use crate::LogmuxError;

/// Renders a record into a byte buffer.
///
/// Formatters are pure functions of the record; the dispatcher relies on
/// this to share a formatted buffer between destinations that use the same
/// formatter instance. Each rendered record must end with `\n` and must not
/// contain interior framing.
pub trait Formatter: Send + Sync {
    fn format(&self, buf: &mut Vec<u8>, record: &LogRecord) -> io::Result<()>;
}

/// Built-in format choice for a destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

fn parse_ts_format(fmt: &str) -> Result<OwnedFormatItem, LogmuxError> {
    time::format_description::parse_owned::<2>(fmt)
        .map_err(|e| LogmuxError::InvalidConfig(format!("bad timestamp format {:?}: {}", fmt, e)))
}

fn format_timestamp(
    record: &LogRecord,
    override_fmt: Option<&OwnedFormatItem>,
) -> Result<String, time::error::Format> {
    match override_fmt {
        Some(items) => record.timestamp().format(items),
        None => record.timestamp().format(&Rfc3339),
    }
}

fn push_raw(buf: &mut Vec<u8>, raw: &[u8]) {
    buf.extend_from_slice(raw);
    if raw.last() != Some(&b'\n') {
        buf.push(b'\n');
    }
}

fn ts_error(e: time::error::Format) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// `[<timestamp>] [<LEVEL>] <message>[ k=v]*` with a trailing newline.
///
/// Field values use the stable scalar stringifier; nested maps and lists are
/// JSON-encoded inline.
pub struct TextFormatter {
    timestamp_format: Option<OwnedFormatItem>,
}

impl TextFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp_format: None,
        }
    }

    /// Overrides the RFC3339 timestamp with a `time` format description.
    pub fn with_timestamp_format(mut self, fmt: &str) -> Result<Self, LogmuxError> {
        self.timestamp_format = Some(parse_ts_format(fmt)?);
        Ok(self)
    }
}

impl Default for TextFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl Formatter for TextFormatter {
    fn format(&self, buf: &mut Vec<u8>, record: &LogRecord) -> io::Result<()> {
        use std::io::Write;

        if let Payload::Raw(raw) = record.payload() {
            push_raw(buf, raw);
            return Ok(());
        }

        let ts = format_timestamp(record, self.timestamp_format.as_ref()).map_err(ts_error)?;
        write!(
            buf,
            "[{}] [{}] {}",
            ts,
            record.level().as_upper_str(),
            record.message()
        )?;
        if let Payload::Structured(entry) = record.payload() {
            for (key, value) in &entry.fields {
                write!(buf, " {}={}", key, value.render_scalar())?;
            }
            if let Some(ref trace) = entry.stack_trace {
                write!(buf, " stack_trace={}", serde_json::to_string(trace)?)?;
            }
        }
        buf.push(b'\n');
        Ok(())
    }
}

/// One JSON object per line: `timestamp`, `level`, `message`, optional
/// `fields` (or flattened siblings), `stack_trace`, `metadata`.
///
/// Nested structures are truncated at the recursion bound with the
/// `"[max depth reached]"` sentinel.
pub struct JsonFormatter {
    flatten_fields: bool,
    timestamp_format: Option<OwnedFormatItem>,
}

impl JsonFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flatten_fields: false,
            timestamp_format: None,
        }
    }

    /// Emit structured fields as top-level siblings instead of under a
    /// `fields` key. Field keys colliding with the fixed keys are skipped.
    #[must_use]
    pub fn flatten_fields(mut self) -> Self {
        self.flatten_fields = true;
        self
    }

    /// Overrides the RFC3339 timestamp with a `time` format description.
    pub fn with_timestamp_format(mut self, fmt: &str) -> Result<Self, LogmuxError> {
        self.timestamp_format = Some(parse_ts_format(fmt)?);
        Ok(self)
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

const FIXED_JSON_KEYS: &[&str] = &["timestamp", "level", "message", "stack_trace", "metadata"];

struct JsonLine<'a> {
    timestamp: &'a str,
    record: &'a LogRecord,
    flatten: bool,
}

impl<'a> Serialize for JsonLine<'a> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("timestamp", self.timestamp)?;
        map.serialize_entry("level", self.record.level().as_str())?;
        map.serialize_entry("message", self.record.message())?;
        if let Payload::Structured(entry) = self.record.payload() {
            self.serialize_structured(&mut map, entry)?;
        }
        map.end()
    }
}

impl<'a> JsonLine<'a> {
    fn serialize_structured<M: SerializeMap>(
        &self,
        map: &mut M,
        entry: &StructuredEntry,
    ) -> Result<(), M::Error> {
        if !entry.fields.is_empty() {
            if self.flatten {
                for (key, value) in &entry.fields {
                    if FIXED_JSON_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    map.serialize_entry(key, &BoundedJson { value, depth: 1 })?;
                }
            } else {
                map.serialize_entry("fields", &BoundedJsonMap(&entry.fields))?;
            }
        }
        if let Some(ref trace) = entry.stack_trace {
            map.serialize_entry("stack_trace", trace)?;
        }
        if let Some(ref metadata) = entry.metadata {
            map.serialize_entry("metadata", &BoundedJsonMap(metadata))?;
        }
        Ok(())
    }
}

impl Formatter for JsonFormatter {
    fn format(&self, buf: &mut Vec<u8>, record: &LogRecord) -> io::Result<()> {
        if let Payload::Raw(raw) = record.payload() {
            push_raw(buf, raw);
            return Ok(());
        }
        let ts = format_timestamp(record, self.timestamp_format.as_ref()).map_err(ts_error)?;
        serde_json::to_writer(
            &mut *buf,
            &JsonLine {
                timestamp: &ts,
                record,
                flatten: self.flatten_fields,
            },
        )?;
        buf.push(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::now_local_or_utc;
    use crate::fields;
    use crate::level::Level;
    use crate::record::{LogRecord, Payload, StructuredEntry};
    use time::macros::datetime;

    fn record_at(level: Level, payload: Payload) -> LogRecord {
        LogRecord::new(level, payload, datetime!(2024-03-07 09:05:01 UTC))
    }

    #[test]
    fn text_shape() {
        let rec = record_at(Level::Info, Payload::Message("hello".into()));
        let mut buf = Vec::new();
        TextFormatter::new().format(&mut buf, &rec).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert_eq!(line, "[2024-03-07T09:05:01Z] [INFO] hello\n");
    }

    #[test]
    fn text_renders_fields_in_key_order() {
        let rec = record_at(
            Level::Warn,
            Payload::Structured(StructuredEntry {
                message: "login".into(),
                fields: fields! { "b" => 2i64, "a" => "x" },
                stack_trace: None,
                metadata: None,
            }),
        );
        let mut buf = Vec::new();
        TextFormatter::new().format(&mut buf, &rec).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.ends_with("login a=x b=2\n"), "line = {:?}", line);
    }

    #[test]
    fn json_shape() {
        let rec = record_at(
            Level::Error,
            Payload::Structured(StructuredEntry {
                message: "boom".into(),
                fields: fields! { "code" => 500i64 },
                stack_trace: Some("at main".into()),
                metadata: None,
            }),
        );
        let mut buf = Vec::new();
        JsonFormatter::new().format(&mut buf, &rec).unwrap();
        assert_eq!(*buf.last().unwrap(), b'\n');
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["level"], "error");
        assert_eq!(v["message"], "boom");
        assert_eq!(v["fields"]["code"], 500);
        assert_eq!(v["stack_trace"], "at main");
        assert_eq!(v["timestamp"], "2024-03-07T09:05:01Z");
    }

    #[test]
    fn json_flatten_puts_fields_at_top_level() {
        let rec = record_at(
            Level::Info,
            Payload::Structured(StructuredEntry {
                message: "m".into(),
                fields: fields! { "user" => "alice", "level" => "sneaky" },
                stack_trace: None,
                metadata: None,
            }),
        );
        let mut buf = Vec::new();
        JsonFormatter::new()
            .flatten_fields()
            .format(&mut buf, &rec)
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["user"], "alice");
        // colliding key is dropped, not allowed to clobber the record level
        assert_eq!(v["level"], "info");
        assert!(v.get("fields").is_none());
    }

    #[test]
    fn raw_payload_passes_through_with_newline() {
        let rec = record_at(Level::Info, Payload::Raw(b"raw bytes".to_vec()));
        let mut buf = Vec::new();
        TextFormatter::new().format(&mut buf, &rec).unwrap();
        assert_eq!(buf, b"raw bytes\n");

        let rec = record_at(Level::Info, Payload::Raw(b"already\n".to_vec()));
        let mut buf = Vec::new();
        JsonFormatter::new().format(&mut buf, &rec).unwrap();
        assert_eq!(buf, b"already\n");
    }

    #[test]
    fn custom_timestamp_format() {
        let rec = record_at(Level::Info, Payload::Message("x".into()));
        let mut buf = Vec::new();
        TextFormatter::new()
            .with_timestamp_format("[year]-[month]-[day]")
            .unwrap()
            .format(&mut buf, &rec)
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[2024-03-07] [INFO] x\n");
    }
}
