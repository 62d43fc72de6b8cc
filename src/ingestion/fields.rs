//! Field extraction shared by the adapters' `normalize` implementations.
//! JSON `null` is treated the same as an absent key.

use serde_json::Value;
use crate::error::{Error, Result};
use crate::types::timestamp::{from_millis, parse_timestamp};
use crate::types::{RawRecord, Ticker, Timestamp};

/// Walks nested objects, e.g. `["quotes", "USD", "price"]`.
pub fn get_path<'a>(raw: &'a RawRecord, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut value = raw.get(*first)?;
    for key in rest {
        value = value.as_object()?.get(*key)?;
    }
    (!value.is_null()).then_some(value)
}

/// Accepts JSON numbers and numeric strings (`"97000.5"`), as upstreams mix both.
pub fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn required_number(raw: &RawRecord, path: &[&str], field: &'static str) -> Result<f64> {
    let value = get_path(raw, path).ok_or_else(|| Error::missing(field))?;
    number(value).ok_or_else(|| Error::validation(field, format!("not a number: {}", value)))
}

pub fn optional_number(raw: &RawRecord, path: &[&str]) -> Option<f64> {
    get_path(raw, path).and_then(number)
}

pub fn ticker(raw: &RawRecord, key: &str) -> Result<Ticker> {
    match get_path(raw, &[key]) {
        Some(Value::String(s)) => Ticker::parse(s),
        Some(other) => Err(Error::validation("ticker", format!("not a string: {}", other))),
        None => Err(Error::missing("ticker")),
    }
}

/// Absent timestamps fall back to `fetched_at`. Strings are parsed; integers
/// are read as epoch milliseconds. Anything else fails validation.
pub fn timestamp_or(raw: &RawRecord, key: &str, fetched_at: Timestamp) -> Result<Timestamp> {
    match get_path(raw, &[key]) {
        None => Ok(fetched_at),
        Some(Value::String(s)) => parse_timestamp(s),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| Error::validation("timestamp", format!("not epoch millis: {}", n)))
            .and_then(from_millis),
        Some(other) => Err(Error::validation("timestamp", format!("unsupported value {}", other))),
    }
}
