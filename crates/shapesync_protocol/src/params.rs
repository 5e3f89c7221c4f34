//! Query parameters and headers owned by the protocol.
//!
//! Consumers may attach their own query parameters to shape requests, but a
//! fixed set of names belongs to the protocol. The sets are versioned so the
//! contract can change explicitly rather than by accident.

/// Version of the reserved parameter sets below.
pub const PARAMS_VERSION: u32 = 1;

/// Parameters the client sets on every request to drive the log position.
pub const PROTOCOL_PARAMS_V1: &[&str] = &["cursor", "handle", "live", "offset"];

/// Parameters derived from the shape definition.
pub const DEFINITION_PARAMS_V1: &[&str] = &["columns", "replica", "table", "where"];

/// Response header carrying the shape handle.
pub const HANDLE_HEADER: &str = "electric-handle";

/// Response header carrying the offset to request next.
pub const OFFSET_HEADER: &str = "electric-offset";

/// Response header carrying the column schema as JSON.
pub const SCHEMA_HEADER: &str = "electric-schema";

/// Response header carrying the live-mode cursor.
pub const CURSOR_HEADER: &str = "electric-cursor";

/// Response header present once the client has caught up.
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";

/// Returns true if `name` belongs to either reserved set.
pub fn is_reserved(name: &str) -> bool {
    PROTOCOL_PARAMS_V1.contains(&name) || DEFINITION_PARAMS_V1.contains(&name)
}

/// Returns every reserved name among `names`, sorted and deduplicated.
pub fn reserved_collisions<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut collisions: Vec<String> = names
        .into_iter()
        .filter(|name| is_reserved(name))
        .map(str::to_string)
        .collect();
    collisions.sort();
    collisions.dedup();
    collisions
}
