//! Column schemas as described by the server.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed set of column types the value parser understands.
///
/// Server type names map onto these variants through
/// [`ColumnType::from_type_name`]; any scalar type without a dedicated
/// variant is carried as [`ColumnType::Text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// `bool`.
    Bool,
    /// `int2`, `int4`, `int8`, `oid`.
    Integer,
    /// `float4`, `float8`.
    Float,
    /// Any other scalar, kept as its text form.
    Text,
    /// `timestamp` without time zone.
    Timestamp,
    /// `timestamptz`.
    TimestampTz,
    /// `date`.
    Date,
    /// `time` without time zone.
    Time,
    /// `timetz`.
    TimeTz,
    /// `json`, `jsonb`.
    Json,
    /// An array whose elements have the inner type.
    Array(Box<ColumnType>),
}

impl ColumnType {
    /// Maps a server type name to a scalar column type.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "bool" => ColumnType::Bool,
            "int2" | "int4" | "int8" | "oid" => ColumnType::Integer,
            "float4" | "float8" => ColumnType::Float,
            "timestamp" => ColumnType::Timestamp,
            "timestamptz" => ColumnType::TimestampTz,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "timetz" => ColumnType::TimeTz,
            "json" | "jsonb" => ColumnType::Json,
            _ => ColumnType::Text,
        }
    }

    /// Short name used in error messages.
    pub fn name(&self) -> String {
        match self {
            ColumnType::Bool => "bool".into(),
            ColumnType::Integer => "integer".into(),
            ColumnType::Float => "float".into(),
            ColumnType::Text => "text".into(),
            ColumnType::Timestamp => "timestamp".into(),
            ColumnType::TimestampTz => "timestamptz".into(),
            ColumnType::Date => "date".into(),
            ColumnType::Time => "time".into(),
            ColumnType::TimeTz => "timetz".into(),
            ColumnType::Json => "json".into(),
            ColumnType::Array(inner) => format!("{}[]", inner.name()),
        }
    }
}

/// Schema entry for one column, as sent in the schema header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Server type name, e.g. `int4` or `timestamptz`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Array dimensions; zero or absent for scalars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<u32>,
    /// Whether the column is declared `NOT NULL`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub not_null: bool,
    /// Position in the primary key, when part of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_index: Option<u32>,
}

impl ColumnInfo {
    /// Creates a nullable scalar column.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            dims: None,
            not_null: false,
            pk_index: None,
        }
    }

    /// Marks the column `NOT NULL`.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Sets the array dimensions.
    pub fn with_dims(mut self, dims: u32) -> Self {
        self.dims = Some(dims);
        self
    }

    /// Resolves the column's parser type. Arrays of any dimension share one
    /// variant; nesting is handled by the array literal itself.
    pub fn column_type(&self) -> ColumnType {
        let scalar = ColumnType::from_type_name(&self.type_name);
        match self.dims {
            Some(dims) if dims > 0 => ColumnType::Array(Box::new(scalar)),
            _ => scalar,
        }
    }
}

/// Column name to column info, as sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    columns: BTreeMap<String, ColumnInfo>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column.
    pub fn with_column(mut self, name: impl Into<String>, info: ColumnInfo) -> Self {
        self.columns.insert(name.into(), info);
        self
    }

    /// Parses the JSON text of a schema header.
    pub fn from_header(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidSchema(e.to_string()))
    }

    /// Looks up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.get(name)
    }

    /// Iterates columns in name order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnInfo)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if no columns are known.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_schema_header() {
        let raw = r#"{"id":{"type":"int4","not_null":true,"pk_index":0},
                      "tags":{"type":"text","dims":1},
                      "created":{"type":"timestamptz","max_length":8}}"#;
        let schema = Schema::from_header(raw).unwrap();
        assert_eq!(schema.len(), 3);

        let id = schema.column("id").unwrap();
        assert!(id.not_null);
        assert_eq!(id.pk_index, Some(0));
        assert_eq!(id.column_type(), ColumnType::Integer);

        let tags = schema.column("tags").unwrap();
        assert!(!tags.not_null);
        assert_eq!(
            tags.column_type(),
            ColumnType::Array(Box::new(ColumnType::Text))
        );

        assert_eq!(
            schema.column("created").unwrap().column_type(),
            ColumnType::TimestampTz
        );
    }

    #[test]
    fn invalid_schema_header() {
        assert!(matches!(
            Schema::from_header("not json"),
            Err(DecodeError::InvalidSchema(_))
        ));
        assert!(matches!(
            Schema::from_header(r#"{"id":{"dims":1}}"#),
            Err(DecodeError::InvalidSchema(_))
        ));
    }

    #[test]
    fn type_names() {
        assert_eq!(ColumnType::from_type_name("int8"), ColumnType::Integer);
        assert_eq!(ColumnType::from_type_name("jsonb"), ColumnType::Json);
        assert_eq!(ColumnType::from_type_name("uuid"), ColumnType::Text);
        assert_eq!(ColumnType::from_type_name("numeric"), ColumnType::Text);
        assert_eq!(
            ColumnType::Array(Box::new(ColumnType::Integer)).name(),
            "integer[]"
        );
    }
}
