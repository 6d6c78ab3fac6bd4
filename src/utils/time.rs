use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// A timestamp as it comes out of storage or a payload, before it is allowed
/// anywhere near an entitlement comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimestamp {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        RawTimestamp::Aware(value.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for RawTimestamp {
    fn from(value: DateTime<FixedOffset>) -> Self {
        RawTimestamp::Aware(value)
    }
}

impl From<NaiveDateTime> for RawTimestamp {
    fn from(value: NaiveDateTime) -> Self {
        RawTimestamp::Naive(value)
    }
}

/// Coerce any stored timestamp into UTC.
///
/// Offset-aware values are converted. Naive values are a data defect: they are
/// read as UTC (the storage convention) and a warning is emitted so the column
/// can be fixed, but they are never compared as-is.
pub fn normalize(raw: RawTimestamp) -> DateTime<Utc> {
    match raw {
        RawTimestamp::Aware(value) => value.with_timezone(&Utc),
        RawTimestamp::Naive(value) => {
            warn!(timestamp = %value, "naive timestamp normalized to UTC");
            Utc.from_utc_datetime(&value)
        }
    }
}

pub fn normalize_opt(raw: Option<RawTimestamp>) -> Option<DateTime<Utc>> {
    raw.map(normalize)
}

/// Provider timestamps are unix seconds.
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

/// Accepts RFC 3339 (offset required) or a naive ISO-8601 value.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(aware) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(normalize(RawTimestamp::Aware(aware)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| normalize(RawTimestamp::Naive(naive)))
}
