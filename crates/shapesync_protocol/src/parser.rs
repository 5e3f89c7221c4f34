//! Wire value parser.
//!
//! Every [`ColumnType`] knows how to turn the server's text encoding into a
//! typed [`Value`]. Nullability is checked once in [`parse_value`], before
//! the type-specific parser runs, so a `NOT NULL` column can never yield a
//! default value in place of a missing one.

use crate::error::{ParseError, ParseResult};
use crate::schema::{ColumnInfo, ColumnType, Schema};
use crate::value::{Row, Value};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use std::iter::Peekable;
use std::str::Chars;

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

impl ColumnType {
    /// Parses one non-null wire literal of this type.
    pub fn parse(&self, column: &str, raw: &str) -> ParseResult<Value> {
        let invalid = || ParseError::InvalidValue {
            column: column.to_string(),
            type_name: self.name(),
            value: raw.to_string(),
        };

        match self {
            ColumnType::Bool => match raw {
                "t" | "true" => Ok(Value::Bool(true)),
                "f" | "false" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            ColumnType::Integer => raw.parse().map(Value::Integer).map_err(|_| invalid()),
            ColumnType::Float => match raw {
                "NaN" => Ok(Value::Float(f64::NAN)),
                "Infinity" => Ok(Value::Float(f64::INFINITY)),
                "-Infinity" => Ok(Value::Float(f64::NEG_INFINITY)),
                _ => raw.parse().map(Value::Float).map_err(|_| invalid()),
            },
            ColumnType::Text => Ok(Value::Text(raw.to_string())),
            ColumnType::Timestamp | ColumnType::TimestampTz | ColumnType::Date
                if is_outside_calendar(raw) =>
            {
                Ok(Value::Text(raw.to_string()))
            }
            ColumnType::Timestamp => parse_naive_timestamp(raw)
                .map(Value::Timestamp)
                .ok_or_else(invalid),
            ColumnType::TimestampTz => parse_timestamptz(raw)
                .map(Value::TimestampTz)
                .ok_or_else(invalid),
            ColumnType::Date => NaiveDate::parse_from_str(raw, DATE_FORMAT)
                .map(Value::Date)
                .map_err(|_| invalid()),
            ColumnType::Time => NaiveTime::parse_from_str(raw, TIME_FORMAT)
                .map(Value::Time)
                .map_err(|_| invalid()),
            ColumnType::TimeTz => {
                let (time, offset) = split_utc_offset(raw, 0).ok_or_else(invalid)?;
                let time = NaiveTime::parse_from_str(time, TIME_FORMAT).map_err(|_| invalid())?;
                Ok(Value::TimeTz(time, offset))
            }
            ColumnType::Json => serde_json::from_str(raw)
                .map(Value::Json)
                .map_err(|_| invalid()),
            ColumnType::Array(element) => {
                let elements =
                    parse_array_literal(raw).map_err(|reason| ParseError::MalformedArray {
                        column: column.to_string(),
                        reason,
                    })?;
                array_value(element, column, elements)
            }
        }
    }
}

/// `infinity`, `-infinity` and BC dates are valid Postgres values with no
/// chrono equivalent. They are kept verbatim as text.
fn is_outside_calendar(raw: &str) -> bool {
    matches!(raw, "infinity" | "-infinity") || raw.ends_with(" BC")
}

/// Parses one raw wire value for `column`.
///
/// `raw` is `None` when the column is absent, `Some(Null)` when the server
/// sent an explicit null. Both fail with [`ParseError::NullValue`] for a
/// `NOT NULL` column. Columns without schema information are nullable text.
pub fn parse_value(
    column: &str,
    info: Option<&ColumnInfo>,
    raw: Option<&serde_json::Value>,
) -> ParseResult<Value> {
    let column_type = info.map(ColumnInfo::column_type).unwrap_or(ColumnType::Text);
    let not_null = info.is_some_and(|info| info.not_null);

    match raw {
        None | Some(serde_json::Value::Null) => {
            if not_null {
                Err(ParseError::NullValue {
                    column: column.to_string(),
                })
            } else {
                Ok(Value::Null)
            }
        }
        Some(serde_json::Value::String(text)) => column_type.parse(column, text),
        Some(other) => parse_json_literal(&column_type, column, other),
    }
}

/// Parses every column present in a raw row.
///
/// Only the columns present are parsed: partial rows (updates carrying just
/// the changed columns) are valid.
pub fn parse_row(
    schema: &Schema,
    raw: &serde_json::Map<String, serde_json::Value>,
) -> ParseResult<Row> {
    raw.iter()
        .map(|(column, value)| {
            parse_value(column, schema.column(column), Some(value))
                .map(|parsed| (column.clone(), parsed))
        })
        .collect()
}

/// Non-string JSON literals: JSON columns take them as they are, arrays may
/// arrive as JSON arrays, and scalars are parsed from their text rendering.
fn parse_json_literal(
    column_type: &ColumnType,
    column: &str,
    raw: &serde_json::Value,
) -> ParseResult<Value> {
    match (column_type, raw) {
        (ColumnType::Json, json) => Ok(Value::Json(json.clone())),
        (ColumnType::Array(element), serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::Null => Ok(Value::Null),
                serde_json::Value::String(text) => element.parse(column, text),
                other => parse_json_literal(element, column, other),
            })
            .collect::<ParseResult<Vec<_>>>()
            .map(Value::Array),
        (ColumnType::Array(_), other) => Err(ParseError::MalformedArray {
            column: column.to_string(),
            reason: format!("expected array literal, found {other}"),
        }),
        (scalar, other) => scalar.parse(column, &other.to_string()),
    }
}

fn parse_naive_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

fn parse_timestamptz(raw: &str) -> Option<DateTime<FixedOffset>> {
    // Skip `YYYY-MM-DD`: its separators are not offset signs.
    let (naive, offset) = split_utc_offset(raw, 10)?;
    parse_naive_timestamp(naive)?
        .and_local_timezone(offset)
        .single()
}

/// Splits `12:00:00+05:30` into the local part and its UTC offset. The sign
/// is searched for at or after byte `from`.
fn split_utc_offset(raw: &str, from: usize) -> Option<(&str, FixedOffset)> {
    let tail = raw.get(from..)?;
    let sign_at = from + tail.rfind(['+', '-'])?;
    let (local, offset) = raw.split_at(sign_at);
    Some((local, parse_utc_offset(offset)?))
}

/// Parses `+HH`, `+HHMM`, `+HH:MM` or `+HH:MM:SS`.
fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let sign = match raw.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = raw[1..].chars().filter(|c| *c != ':').collect();
    if !digits.bytes().all(|b| b.is_ascii_digit()) || !matches!(digits.len(), 2 | 4 | 6) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> i32 {
        digits.get(range).and_then(|d| d.parse().ok()).unwrap_or(0)
    };
    let seconds = field(0..2) * 3600 + field(2..4) * 60 + field(4..6);
    FixedOffset::east_opt(sign * seconds)
}

/// One element of a Postgres array literal, before typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayElement {
    /// Unquoted `NULL`.
    Null,
    /// A scalar element, unescaped.
    Text(String),
    /// A nested array.
    Array(Vec<ArrayElement>),
}

fn array_value(
    element: &ColumnType,
    column: &str,
    items: Vec<ArrayElement>,
) -> ParseResult<Value> {
    items
        .into_iter()
        .map(|item| match item {
            ArrayElement::Null => Ok(Value::Null),
            ArrayElement::Text(text) => element.parse(column, &text),
            ArrayElement::Array(nested) => array_value(element, column, nested),
        })
        .collect::<ParseResult<Vec<_>>>()
        .map(Value::Array)
}

/// Parses a Postgres array literal such as `{1,NULL,"a,b",{2,3}}`.
///
/// An optional dimension decoration (`[0:1]={...}`) is skipped.
pub fn parse_array_literal(raw: &str) -> Result<Vec<ArrayElement>, String> {
    let mut literal = raw.trim();
    if literal.starts_with('[') {
        let (_, rest) = literal
            .split_once('=')
            .ok_or_else(|| "dimension decoration without '='".to_string())?;
        literal = rest.trim_start();
    }

    let mut chars = literal.chars().peekable();
    let items = parse_array(&mut chars)?;
    match chars.find(|c| !c.is_whitespace()) {
        Some(c) => Err(format!("unexpected {c:?} after closing brace")),
        None => Ok(items),
    }
}

fn parse_array(chars: &mut Peekable<Chars<'_>>) -> Result<Vec<ArrayElement>, String> {
    if chars.next() != Some('{') {
        return Err("expected '{'".into());
    }
    let mut items = Vec::new();
    skip_whitespace(chars);
    if chars.peek() == Some(&'}') {
        chars.next();
        return Ok(items);
    }

    loop {
        skip_whitespace(chars);
        let item = match chars.peek() {
            Some('{') => ArrayElement::Array(parse_array(chars)?),
            Some('"') => {
                chars.next();
                ArrayElement::Text(parse_quoted(chars)?)
            }
            Some(_) => parse_unquoted(chars)?,
            None => return Err("unterminated array".into()),
        };
        items.push(item);

        skip_whitespace(chars);
        match chars.next() {
            Some(',') => continue,
            Some('}') => return Ok(items),
            Some(c) => return Err(format!("unexpected {c:?} in array")),
            None => return Err("unterminated array".into()),
        }
    }
}

fn parse_quoted(chars: &mut Peekable<Chars<'_>>) -> Result<String, String> {
    let mut text = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some(c) => text.push(c),
                None => return Err("unterminated escape".into()),
            },
            Some('"') => return Ok(text),
            Some(c) => text.push(c),
            None => return Err("unterminated quoted element".into()),
        }
    }
}

fn parse_unquoted(chars: &mut Peekable<Chars<'_>>) -> Result<ArrayElement, String> {
    let mut text = String::new();
    while let Some(&c) = chars.peek() {
        if c == ',' || c == '}' {
            break;
        }
        if c == '{' || c == '"' {
            return Err(format!("unexpected {c:?} in unquoted element"));
        }
        text.push(c);
        chars.next();
    }
    let text = text.trim_end();
    if text.is_empty() {
        return Err("empty element".into());
    }
    if text.eq_ignore_ascii_case("NULL") {
        Ok(ArrayElement::Null)
    } else {
        Ok(ArrayElement::Text(text.to_string()))
    }
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use proptest::prelude::*;
    use serde_json::json;

    fn parse(info: ColumnInfo, raw: serde_json::Value) -> ParseResult<Value> {
        parse_value("col", Some(&info), Some(&raw))
    }

    #[test]
    fn null_in_not_null_column_fails() {
        let info = ColumnInfo::new("int4").not_null();
        let err = parse_value("id", Some(&info), Some(&serde_json::Value::Null)).unwrap_err();
        assert_eq!(
            err,
            ParseError::NullValue {
                column: "id".into()
            }
        );
        let err = parse_value("id", Some(&info), None).unwrap_err();
        assert!(matches!(err, ParseError::NullValue { column } if column == "id"));
    }

    #[test]
    fn null_in_nullable_column() {
        let value = parse(ColumnInfo::new("int4"), serde_json::Value::Null).unwrap();
        assert!(value.is_null());
        assert!(parse_value("x", None, None).unwrap().is_null());
    }

    #[test]
    fn scalars() {
        assert_eq!(parse(ColumnInfo::new("bool"), json!("t")).unwrap(), Value::Bool(true));
        assert_eq!(parse(ColumnInfo::new("bool"), json!("false")).unwrap(), Value::Bool(false));
        assert_eq!(parse(ColumnInfo::new("int8"), json!("-42")).unwrap(), Value::Integer(-42));
        assert_eq!(parse(ColumnInfo::new("float8"), json!("1.5")).unwrap(), Value::Float(1.5));
        assert_eq!(
            parse(ColumnInfo::new("float4"), json!("-Infinity")).unwrap(),
            Value::Float(f64::NEG_INFINITY)
        );
        match parse(ColumnInfo::new("float8"), json!("NaN")).unwrap() {
            Value::Float(f) => assert!(f.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse(ColumnInfo::new("uuid"), json!("0b5f-x")).unwrap(),
            Value::Text("0b5f-x".into())
        );
    }

    #[test]
    fn non_string_literals() {
        assert_eq!(parse(ColumnInfo::new("int4"), json!(7)).unwrap(), Value::Integer(7));
        assert_eq!(parse(ColumnInfo::new("bool"), json!(true)).unwrap(), Value::Bool(true));
        assert_eq!(
            parse(ColumnInfo::new("jsonb"), json!({"a": 1})).unwrap(),
            Value::Json(json!({"a": 1}))
        );
        assert_eq!(
            parse(ColumnInfo::new("int4").with_dims(1), json!([1, null, "3"])).unwrap(),
            Value::Array(vec![Value::Integer(1), Value::Null, Value::Integer(3)])
        );
    }

    #[test]
    fn invalid_literals() {
        let err = parse(ColumnInfo::new("int4"), json!("abc")).unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { ref type_name, .. } if type_name == "integer"));
        assert!(parse(ColumnInfo::new("bool"), json!("yes")).is_err());
        assert!(parse(ColumnInfo::new("json"), json!("{oops")).is_err());
        assert!(parse(ColumnInfo::new("date"), json!("13/09/2023")).is_err());
    }

    #[test]
    fn naive_timestamp_round_trip() {
        let literal = "2023-09-13 23:33:04.271";
        let value = parse(ColumnInfo::new("timestamp"), json!(literal)).unwrap();
        match &value {
            Value::Timestamp(ts) => {
                assert_eq!((ts.year(), ts.month(), ts.day()), (2023, 9, 13));
                assert_eq!((ts.hour(), ts.minute(), ts.second()), (23, 33, 4));
                assert_eq!(ts.nanosecond(), 271_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(value.to_wire().unwrap(), literal);
    }

    #[test]
    fn timestamptz_keeps_offset() {
        for literal in [
            "2023-09-13 23:33:04.271+00",
            "2023-09-13 23:33:04+05:30",
            "1999-01-08 04:05:06.123456-08",
        ] {
            let value = parse(ColumnInfo::new("timestamptz"), json!(literal)).unwrap();
            assert!(matches!(value, Value::TimestampTz(_)));
            assert_eq!(value.to_wire().unwrap(), literal);
        }

        let a = parse(ColumnInfo::new("timestamptz"), json!("2023-09-13 23:33:04+02")).unwrap();
        let b = parse(ColumnInfo::new("timestamptz"), json!("2023-09-13 21:33:04+00")).unwrap();
        match (a, b) {
            (Value::TimestampTz(a), Value::TimestampTz(b)) => assert_eq!(a, b),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dates_and_times() {
        for (type_name, literal) in [
            ("date", "2024-02-29"),
            ("time", "08:15:00"),
            ("time", "08:15:00.5"),
            ("timetz", "08:15:00+01"),
            ("timetz", "23:59:59.999-03:30"),
        ] {
            let value = parse(ColumnInfo::new(type_name), json!(literal)).unwrap();
            assert_eq!(value.to_wire().unwrap(), literal, "{type_name}");
        }
    }

    #[test]
    fn infinite_and_bc_dates_stay_text() {
        for (type_name, literal) in [
            ("timestamp", "infinity"),
            ("timestamptz", "-infinity"),
            ("date", "infinity"),
            ("date", "0044-03-15 BC"),
            ("timestamptz", "0044-03-15 12:00:00+00 BC"),
        ] {
            let value = parse(ColumnInfo::new(type_name), json!(literal)).unwrap();
            assert_eq!(value, Value::Text(literal.into()), "{type_name}");
            assert_eq!(value.to_wire().unwrap(), literal);
        }
        assert!(parse(ColumnInfo::new("date"), json!("Infinity")).is_err());
        assert!(parse(ColumnInfo::new("time"), json!("infinity")).is_err());
    }

    #[test]
    fn array_literals() {
        let value = parse(
            ColumnInfo::new("text").with_dims(1),
            json!(r#"{plain,"with space","a,b","q\"uote",NULL,"NULL"}"#),
        )
        .unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Text("plain".into()),
                Value::Text("with space".into()),
                Value::Text("a,b".into()),
                Value::Text("q\"uote".into()),
                Value::Null,
                Value::Text("NULL".into()),
            ])
        );

        let nested = parse(ColumnInfo::new("int4").with_dims(2), json!("{{1,2},{3,4}}")).unwrap();
        assert_eq!(
            nested,
            Value::Array(vec![
                Value::Array(vec![Value::Integer(1), Value::Integer(2)]),
                Value::Array(vec![Value::Integer(3), Value::Integer(4)]),
            ])
        );

        assert_eq!(
            parse(ColumnInfo::new("int4").with_dims(1), json!("{}")).unwrap(),
            Value::Array(vec![])
        );
        assert_eq!(
            parse(ColumnInfo::new("int4").with_dims(1), json!("[1:2]={5,6}")).unwrap(),
            Value::Array(vec![Value::Integer(5), Value::Integer(6)])
        );
    }

    #[test]
    fn array_elements_are_typed() {
        let value = parse(
            ColumnInfo::new("timestamp").with_dims(1),
            json!(r#"{"2023-09-13 23:33:04.271",NULL}"#),
        )
        .unwrap();
        match value {
            Value::Array(items) => {
                assert!(matches!(items[0], Value::Timestamp(_)));
                assert!(items[1].is_null());
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = parse(ColumnInfo::new("int4").with_dims(1), json!("{1,x}")).unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));
    }

    #[test]
    fn malformed_arrays() {
        for raw in ["1,2", "{1,2", "{1,,2}", "{\"open}", "{1}}", "{a\"b}"] {
            let err = parse(ColumnInfo::new("int4").with_dims(1), json!(raw)).unwrap_err();
            assert!(
                matches!(err, ParseError::MalformedArray { .. }),
                "{raw:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn parse_whole_row() {
        let schema = Schema::new()
            .with_column("id", ColumnInfo::new("int4").not_null())
            .with_column("title", ColumnInfo::new("text"));
        let raw = json!({"id": "1", "title": null, "extra": "x"});
        let row = parse_row(&schema, raw.as_object().unwrap()).unwrap();
        assert_eq!(row["id"], Value::Integer(1));
        assert!(row["title"].is_null());
        assert_eq!(row["extra"], Value::Text("x".into()));

        let raw = json!({"id": null});
        let err = parse_row(&schema, raw.as_object().unwrap()).unwrap_err();
        assert_eq!(err.column(), "id");
    }

    proptest! {
        #[test]
        fn text_arrays_round_trip(items in proptest::collection::vec(proptest::option::of("[ -~]{0,8}"), 0..6)) {
            let value = Value::Array(
                items
                    .iter()
                    .map(|item| item.clone().map(Value::Text).unwrap_or(Value::Null))
                    .collect(),
            );
            let literal = value.to_wire().unwrap();
            let parsed = ColumnType::Array(Box::new(ColumnType::Text)).parse("col", &literal).unwrap();
            prop_assert_eq!(parsed, value);
        }
    }
}
