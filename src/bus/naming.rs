//! Logical event name to JetStream addressing.
//!
//! Publishers and subscribers both derive addresses here, so they agree
//! without coordination. Event names may not contain the subject separator
//! inside a stream, so `.` becomes `_`. Two names that differ only by `.`
//! versus `_` map to the same subject; callers must not rely on that
//! distinction.

/// Subject for `name` inside the stream `stream_prefix`.
pub fn wire_subject(name: &str, stream_prefix: &str) -> String {
    format!("{}.{}", stream_prefix, name.replace('.', "_"))
}

/// Durable consumer identifier for the `(name, group)` pair.
///
/// Unique per event and group within a stream.
pub fn durable_consumer_id(name: &str, stream_prefix: &str, group: &str) -> String {
    format!("{}_{}", wire_subject(name, stream_prefix), group)
}
