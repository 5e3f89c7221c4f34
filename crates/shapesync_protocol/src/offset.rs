//! Log positions and shape handles.

use crate::error::DecodeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A position in a shape's change log.
///
/// The wire form is either `-1` (no progress yet) or `<tx>_<op>`, where both
/// parts are unsigned decimal numbers. Offsets are totally ordered, with
/// [`Offset::Initial`] below every log position.
///
/// `Display` reproduces the wire literal exactly, so an offset received from
/// the server can be echoed back verbatim on the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Offset {
    /// The sentinel `-1`: nothing has been consumed yet.
    #[default]
    Initial,
    /// A concrete log position.
    Log {
        /// Transaction component.
        tx: u64,
        /// Operation index within the transaction.
        op: u64,
    },
}

impl Offset {
    /// Wire literal of the sentinel offset.
    pub const INITIAL_LITERAL: &'static str = "-1";

    /// Creates a log offset.
    pub fn new(tx: u64, op: u64) -> Self {
        Offset::Log { tx, op }
    }

    /// Returns true for the `-1` sentinel.
    pub fn is_initial(&self) -> bool {
        matches!(self, Offset::Initial)
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Offset::Initial, Offset::Initial) => Ordering::Equal,
            (Offset::Initial, Offset::Log { .. }) => Ordering::Less,
            (Offset::Log { .. }, Offset::Initial) => Ordering::Greater,
            (Offset::Log { tx: a, op: b }, Offset::Log { tx: c, op: d }) => (a, b).cmp(&(c, d)),
        }
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Initial => f.write_str(Self::INITIAL_LITERAL),
            Offset::Log { tx, op } => write!(f, "{tx}_{op}"),
        }
    }
}

/// Parses one canonical unsigned decimal component (no sign, no leading zeros).
fn parse_component(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

impl FromStr for Offset {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::INITIAL_LITERAL {
            return Ok(Offset::Initial);
        }
        let invalid = || DecodeError::InvalidOffset(s.to_string());
        let (tx, op) = s.split_once('_').ok_or_else(invalid)?;
        let tx = parse_component(tx).ok_or_else(invalid)?;
        let op = parse_component(op).ok_or_else(invalid)?;
        Ok(Offset::Log { tx, op })
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque server-assigned identifier of one shape instance.
///
/// A handle binds a log position to a specific materialization on the
/// server; when it changes, every offset obtained under the old handle is
/// void.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShapeHandle(String);

impl ShapeHandle {
    /// Creates a handle, rejecting empty strings.
    pub fn new(handle: impl Into<String>) -> Result<Self, DecodeError> {
        let handle = handle.into();
        if handle.trim().is_empty() {
            return Err(DecodeError::InvalidHandle);
        }
        Ok(Self(handle))
    }

    /// Returns the handle text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ShapeHandle {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ShapeHandle> for String {
    fn from(handle: ShapeHandle) -> Self {
        handle.0
    }
}

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
