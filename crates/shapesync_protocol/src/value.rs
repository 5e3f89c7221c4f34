//! Typed column values.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::BTreeMap;

/// A parsed row: column name to typed value.
pub type Row = BTreeMap<String, Value>;

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any integer column.
    Integer(i64),
    /// Any floating point column.
    Float(f64),
    /// Text, every type without a dedicated variant, and `infinity` or BC
    /// dates and timestamps.
    Text(String),
    /// Timestamp without time zone, as the server wrote it.
    Timestamp(NaiveDateTime),
    /// Timestamp with its original UTC offset.
    TimestampTz(DateTime<FixedOffset>),
    /// Calendar date.
    Date(NaiveDate),
    /// Time of day without time zone.
    Time(NaiveTime),
    /// Time of day with its UTC offset.
    TimeTz(NaiveTime, FixedOffset),
    /// JSON document.
    Json(serde_json::Value),
    /// Array of values; nested arrays are nested `Array` values.
    Array(Vec<Value>),
}

impl Value {
    /// Returns true for `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Renders the value back to the server's text encoding.
    ///
    /// Returns `None` for `NULL`. Dates and times use the same layout the
    /// server emits, so a parsed literal renders back byte for byte.
    pub fn to_wire(&self) -> Option<String> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(b) => String::from(if *b { "t" } else { "f" }),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => format!(
                "{}{}",
                ts.format("%Y-%m-%d %H:%M:%S"),
                fraction(ts.nanosecond())
            ),
            Value::TimestampTz(ts) => format!(
                "{}{}{}",
                ts.format("%Y-%m-%d %H:%M:%S"),
                fraction(ts.nanosecond()),
                format_utc_offset(*ts.offset())
            ),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => format!("{}{}", t.format("%H:%M:%S"), fraction(t.nanosecond())),
            Value::TimeTz(t, offset) => format!(
                "{}{}{}",
                t.format("%H:%M:%S"),
                fraction(t.nanosecond()),
                format_utc_offset(*offset)
            ),
            Value::Json(json) => json.to_string(),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(array_element).collect();
                format!("{{{}}}", rendered.join(","))
            }
        };
        Some(text)
    }

    /// Converts the value to plain JSON for display or export.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(format_float(*f))),
            Value::Json(json) => json.clone(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            other => other
                .to_wire()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".into()
    } else if f.is_infinite() {
        String::from(if f > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        f.to_string()
    }
}

/// Fractional seconds with trailing zeros trimmed, or nothing for whole seconds.
fn fraction(nanos: u32) -> String {
    if nanos == 0 {
        return String::new();
    }
    let digits = format!("{:09}", nanos % 1_000_000_000);
    format!(".{}", digits.trim_end_matches('0'))
}

/// `+HH` when the minutes are zero, `+HH:MM` otherwise.
fn format_utc_offset(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let seconds = seconds.abs();
    let (hours, minutes) = (seconds / 3600, (seconds % 3600) / 60);
    if minutes == 0 {
        format!("{sign}{hours:02}")
    } else {
        format!("{sign}{hours:02}:{minutes:02}")
    }
}

fn array_element(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Array(_) => value.to_wire().unwrap_or_default(),
        other => {
            let text = other.to_wire().unwrap_or_default();
            let needs_quotes = text.is_empty()
                || text.eq_ignore_ascii_case("NULL")
                || text
                    .chars()
                    .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
            if needs_quotes {
                let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            } else {
                text
            }
        }
    }
}
