//! Response decoding.
//!
//! A shape response is a JSON array of messages plus a handful of headers.
//! Change messages carry a row operation, control messages carry protocol
//! signals. Anything this client does not recognise is rejected with a
//! [`DecodeError`] instead of being dropped; unknown *fields* inside a
//! recognised message are ignored.

use crate::error::{DecodeError, ParseResult};
use crate::offset::{Offset, ShapeHandle};
use crate::params::{CURSOR_HEADER, HANDLE_HEADER, OFFSET_HEADER, SCHEMA_HEADER, UP_TO_DATE_HEADER};
use crate::parser::parse_row;
use crate::schema::Schema;
use crate::value::Row;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Row was inserted.
    Insert,
    /// Row was updated; the value may carry only the changed columns.
    Update,
    /// Row was deleted; the value carries at least the primary key.
    Delete,
}

impl OperationKind {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "insert" => Some(OperationKind::Insert),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-data protocol signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Every operation up to the response offset has been sent.
    UpToDate,
    /// The shape was invalidated; the client must start over.
    MustRefetch,
}

impl ControlMessage {
    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "up-to-date" => Some(ControlMessage::UpToDate),
            "must-refetch" => Some(ControlMessage::MustRefetch),
            _ => None,
        }
    }
}

/// A change message with its row still in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMessage {
    /// Row key, stable across operations on the same row.
    pub key: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Raw column values.
    pub value: Map<String, Json>,
    /// Offset carried by the message itself, if any.
    pub offset: Option<Offset>,
    /// Message headers, including ones this client does not interpret.
    pub headers: Map<String, Json>,
}

impl ChangeMessage {
    /// Parses the row through the value parser.
    ///
    /// `response_offset` is used when the message carries no offset of its
    /// own.
    pub fn into_operation(self, schema: &Schema, response_offset: Offset) -> ParseResult<Operation> {
        let value = parse_row(schema, &self.value)?;
        Ok(Operation {
            key: self.key,
            kind: self.kind,
            value,
            offset: self.offset.unwrap_or(response_offset),
            headers: self.headers,
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Row change.
    Change(ChangeMessage),
    /// Protocol signal.
    Control(ControlMessage),
}

/// A typed row operation, ready for consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Row key.
    pub key: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Parsed column values.
    pub value: Row,
    /// Log position of the operation.
    pub offset: Offset,
    /// Message headers.
    pub headers: Map<String, Json>,
}

/// Everything a single response tells the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedResponse {
    /// Change messages in body order.
    pub changes: Vec<ChangeMessage>,
    /// The control signal, if any. `MustRefetch` wins over `UpToDate`.
    pub control: Option<ControlMessage>,
    /// Shape handle header.
    pub handle: Option<ShapeHandle>,
    /// Next offset header.
    pub offset: Option<Offset>,
    /// Live cursor header.
    pub cursor: Option<String>,
    /// Schema header.
    pub schema: Option<Schema>,
    /// True if the client has caught up after this response.
    pub up_to_date: bool,
}

impl DecodedResponse {
    /// Returns true if the server invalidated the shape.
    pub fn must_refetch(&self) -> bool {
        self.control == Some(ControlMessage::MustRefetch)
    }
}

/// Decodes a response body into messages.
///
/// An empty (or all-whitespace) body decodes to no messages.
pub fn decode_messages(body: &str) -> Result<Vec<Message>, DecodeError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let json: Json =
        serde_json::from_str(body).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let items = match json {
        Json::Array(items) => items,
        other => return Err(DecodeError::NotAnArray(json_kind(&other))),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| decode_message(index, item))
        .collect()
}

fn decode_message(index: usize, item: Json) -> Result<Message, DecodeError> {
    let Json::Object(mut object) = item else {
        return Err(DecodeError::NotAnObject { index });
    };
    let headers = match object.remove("headers") {
        Some(Json::Object(headers)) => headers,
        _ => return Err(DecodeError::MissingField { index, field: "headers" }),
    };

    if let Some(control) = headers.get("control") {
        let raw = control.as_str().unwrap_or_default();
        return ControlMessage::from_wire(raw)
            .map(Message::Control)
            .ok_or_else(|| DecodeError::UnknownControl {
                index,
                control: control.as_str().map_or_else(|| control.to_string(), str::to_string),
            });
    }

    let Some(operation) = headers.get("operation") else {
        return Err(DecodeError::UnknownMessage { index });
    };
    let kind = operation
        .as_str()
        .and_then(OperationKind::from_wire)
        .ok_or_else(|| DecodeError::UnknownOperation {
            index,
            operation: operation.as_str().map_or_else(|| operation.to_string(), str::to_string),
        })?;

    let key = match object.remove("key") {
        Some(Json::String(key)) => key,
        _ => return Err(DecodeError::MissingField { index, field: "key" }),
    };
    let value = match object.remove("value") {
        Some(Json::Object(value)) => value,
        None if kind == OperationKind::Delete => Map::new(),
        _ => return Err(DecodeError::MissingField { index, field: "value" }),
    };
    let offset = match object.remove("offset") {
        Some(Json::String(raw)) => Some(raw.parse()?),
        Some(Json::Null) | None => None,
        Some(other) => return Err(DecodeError::InvalidOffset(other.to_string())),
    };

    Ok(Message::Change(ChangeMessage {
        key,
        kind,
        value,
        offset,
        headers,
    }))
}

/// Decodes a full response: status, lower-cased headers and body.
///
/// Status 204 carries no body and means the client is up to date.
pub fn decode_response(
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &str,
) -> Result<DecodedResponse, DecodeError> {
    let mut decoded = DecodedResponse {
        handle: headers
            .get(HANDLE_HEADER)
            .map(|raw| ShapeHandle::new(raw.as_str()))
            .transpose()?,
        offset: headers
            .get(OFFSET_HEADER)
            .map(|raw| raw.parse())
            .transpose()?,
        cursor: headers.get(CURSOR_HEADER).cloned(),
        schema: headers
            .get(SCHEMA_HEADER)
            .map(|raw| Schema::from_header(raw))
            .transpose()?,
        up_to_date: status == 204 || headers.contains_key(UP_TO_DATE_HEADER),
        ..DecodedResponse::default()
    };

    let messages = if status == 204 {
        Vec::new()
    } else {
        decode_messages(body)?
    };

    for message in messages {
        match message {
            Message::Change(change) => decoded.changes.push(change),
            Message::Control(ControlMessage::MustRefetch) => {
                decoded.control = Some(ControlMessage::MustRefetch);
            }
            Message::Control(ControlMessage::UpToDate) => {
                decoded.up_to_date = true;
                if decoded.control.is_none() {
                    decoded.control = Some(ControlMessage::UpToDate);
                }
            }
        }
    }
    if decoded.up_to_date && decoded.control.is_none() {
        decoded.control = Some(ControlMessage::UpToDate);
    }

    Ok(decoded)
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnInfo;
    use crate::value::Value;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const BODY: &str = r#"[
        {"key":"\"public\".\"items\"/\"1\"","value":{"id":"1","title":"a"},
         "headers":{"operation":"insert","relation":["public","items"]}},
        {"key":"\"public\".\"items\"/\"1\"","value":{"id":"1"},
         "headers":{"operation":"delete"},"offset":"5_1"},
        {"headers":{"control":"up-to-date"}}
    ]"#;

    #[test]
    fn decode_changes_and_control() {
        let messages = decode_messages(BODY).unwrap();
        assert_eq!(messages.len(), 3);
        match &messages[0] {
            Message::Change(change) => {
                assert_eq!(change.kind, OperationKind::Insert);
                assert_eq!(change.value["title"], Json::String("a".into()));
                assert_eq!(change.offset, None);
                assert!(change.headers.contains_key("relation"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &messages[1] {
            Message::Change(change) => {
                assert_eq!(change.kind, OperationKind::Delete);
                assert_eq!(change.offset, Some(Offset::new(5, 1)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(messages[2], Message::Control(ControlMessage::UpToDate));
    }

    #[test]
    fn empty_body_has_no_messages() {
        assert!(decode_messages("").unwrap().is_empty());
        assert!(decode_messages("[]").unwrap().is_empty());
    }

    #[test]
    fn unknown_shapes_fail_fast() {
        assert!(matches!(
            decode_messages("{}"),
            Err(DecodeError::NotAnArray("an object"))
        ));
        assert!(matches!(
            decode_messages("[1]"),
            Err(DecodeError::NotAnObject { index: 0 })
        ));
        assert!(matches!(
            decode_messages(r#"[{"key":"k"}]"#),
            Err(DecodeError::MissingField { field: "headers", .. })
        ));
        assert!(matches!(
            decode_messages(r#"[{"headers":{"control":"snapshot-begin"}}]"#),
            Err(DecodeError::UnknownControl { .. })
        ));
        assert!(matches!(
            decode_messages(r#"[{"key":"k","value":{},"headers":{"operation":"upsert"}}]"#),
            Err(DecodeError::UnknownOperation { .. })
        ));
        assert!(matches!(
            decode_messages(r#"[{"headers":{"lsn":"1"}}]"#),
            Err(DecodeError::UnknownMessage { index: 0 })
        ));
        assert!(matches!(
            decode_messages(r#"[{"value":{},"headers":{"operation":"insert"}}]"#),
            Err(DecodeError::MissingField { field: "key", .. })
        ));
        assert!(matches!(
            decode_messages(r#"[{"key":"k","headers":{"operation":"update"}}]"#),
            Err(DecodeError::MissingField { field: "value", .. })
        ));
        assert!(matches!(decode_messages("[{"), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn decode_response_metadata() {
        let hdrs = headers(&[
            (HANDLE_HEADER, "3833821-1721812114261"),
            (OFFSET_HEADER, "26800584_4"),
            (SCHEMA_HEADER, r#"{"id":{"type":"int4","not_null":true}}"#),
        ]);
        let decoded = decode_response(200, &hdrs, BODY).unwrap();
        assert_eq!(decoded.changes.len(), 2);
        assert_eq!(decoded.control, Some(ControlMessage::UpToDate));
        assert!(decoded.up_to_date);
        assert_eq!(decoded.handle.unwrap().as_str(), "3833821-1721812114261");
        assert_eq!(decoded.offset, Some(Offset::new(26800584, 4)));
        assert!(decoded.schema.unwrap().column("id").unwrap().not_null);
        assert!(decoded.cursor.is_none());
    }

    #[test]
    fn up_to_date_header_without_control() {
        let hdrs = headers(&[(UP_TO_DATE_HEADER, ""), (CURSOR_HEADER, "1234")]);
        let decoded = decode_response(200, &hdrs, "[]").unwrap();
        assert!(decoded.up_to_date);
        assert_eq!(decoded.control, Some(ControlMessage::UpToDate));
        assert_eq!(decoded.cursor.as_deref(), Some("1234"));

        let decoded = decode_response(204, &BTreeMap::new(), "").unwrap();
        assert!(decoded.up_to_date);
        assert!(decoded.changes.is_empty());
    }

    #[test]
    fn must_refetch_dominates() {
        let body = r#"[{"headers":{"control":"up-to-date"}},{"headers":{"control":"must-refetch"}}]"#;
        let decoded = decode_response(200, &BTreeMap::new(), body).unwrap();
        assert!(decoded.must_refetch());
    }

    #[test]
    fn invalid_headers() {
        let hdrs = headers(&[(OFFSET_HEADER, "soon")]);
        assert!(matches!(
            decode_response(200, &hdrs, "[]"),
            Err(DecodeError::InvalidOffset(_))
        ));
        let hdrs = headers(&[(SCHEMA_HEADER, "{")]);
        assert!(matches!(
            decode_response(200, &hdrs, "[]"),
            Err(DecodeError::InvalidSchema(_))
        ));
        let hdrs = headers(&[(HANDLE_HEADER, "")]);
        assert!(matches!(
            decode_response(200, &hdrs, "[]"),
            Err(DecodeError::InvalidHandle)
        ));
    }

    #[test]
    fn change_into_operation() {
        let schema = Schema::new().with_column("id", ColumnInfo::new("int4").not_null());
        let messages = decode_messages(BODY).unwrap();
        let Message::Change(insert) = messages[0].clone() else {
            panic!("expected change");
        };
        let op = insert.into_operation(&schema, Offset::new(9, 0)).unwrap();
        assert_eq!(op.value["id"], Value::Integer(1));
        assert_eq!(op.offset, Offset::new(9, 0));

        let Message::Change(delete) = messages[1].clone() else {
            panic!("expected change");
        };
        let op = delete.into_operation(&schema, Offset::new(9, 0)).unwrap();
        assert_eq!(op.offset, Offset::new(5, 1));
    }
}
