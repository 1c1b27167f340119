use time::format_description::FormatItem;
use time::{format_description, OffsetDateTime, PrimitiveDateTime, UtcOffset};

// Suffix appended to rotated files. Zero-padded and lexicographically
// sortable, so filename order equals age order for a monotonic clock.
const ROTATION_TS_S: &str = "[year][month][day]-[hour][minute][second].[subsecond digits:9]";

lazy_static::lazy_static! {
    pub(crate) static ref ROTATION_TS: Vec<FormatItem<'static>> =
        format_description::parse(ROTATION_TS_S).unwrap(/*ok*/);
}

/// Current wall time with the local offset, falling back to UTC where the
/// local offset cannot be determined.
pub(crate) fn now_local_or_utc() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Current wall time in the configured zone, or local-or-UTC when no zone
/// was configured.
pub(crate) fn now_in_zone(offset: Option<UtcOffset>) -> OffsetDateTime {
    match offset {
        Some(o) => OffsetDateTime::now_utc().to_offset(o),
        None => now_local_or_utc(),
    }
}

/// Formats `ts` as a rotation suffix (UTC).
pub(crate) fn rotation_timestamp(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC).format(&ROTATION_TS).unwrap(/*ok*/)
}

/// Parses a rotation suffix back into a UTC timestamp.
///
/// Returns `None` for suffixes that do not match the rotation format, e.g.
/// foreign files that merely share the base-path prefix.
pub(crate) fn parse_rotation_timestamp(s: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(s, &ROTATION_TS)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
