use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use crate::error::{Error, Result};

pub type Timestamp = DateTime<Utc>;

/// Sub-second digits kept on every record timestamp. Stores persist
/// microseconds, so anything finer would make a stored high-water-mark sort
/// before the record that set it.
pub const SUBSEC_DIGITS: u16 = 6;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Drops precision below a microsecond.
pub fn truncate(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(SUBSEC_DIGITS)
}

/// Parses an upstream timestamp. Offsets are honoured and converted to UTC;
/// naive date-times (and bare dates, at midnight) are taken to be UTC already.
/// The result is truncated to microseconds.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp> {
    parse_exact(raw).map(truncate)
}

fn parse_exact(raw: &str) -> Result<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::validation("timestamp", "empty"));
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(Error::validation("timestamp", format!("unparseable `{}`", raw)))
}

pub fn from_millis(millis: i64) -> Result<Timestamp> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::validation("timestamp", format!("out of range: {}", millis)))
}
