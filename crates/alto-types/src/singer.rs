//! Singer wire message handling.
//!
//! Messages are newline-delimited JSON objects with a `type` discriminator.
//! The runner only ever needs to *classify* a line (cheaply, without a full
//! parse) and to *parse* the two kinds it acts on: STATE (intercepted) and
//! RECORD/SCHEMA (reservoir grouping, PII hashing). Everything else passes
//! through byte-identical.

use serde_json::{Map, Value};

/// Message kinds the orchestrator distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Record,
    Schema,
    State,
    /// ACTIVATE_VERSION, BATCH, or any other typed message.
    Other,
    /// Not a JSON object at all.
    NotJson,
}

/// Classify a raw line by inspecting its first bytes.
///
/// Works for the common case where `"type"` is the first key, both in
/// compact (`{"type":"RECORD"`) and loose (`{"type": "RECORD"`) form.
/// Falls back to [`MessageKind::Other`] when the shape is unexpected; the
/// caller parses fully in that case if it cares.
#[must_use]
pub fn message_kind(raw: &[u8]) -> MessageKind {
    if raw.first() != Some(&b'{') {
        return MessageKind::NotJson;
    }
    if raw.get(2..6) != Some(&b"type"[..]) {
        return MessageKind::Other;
    }
    // `{"type": "X"` puts the discriminator at 10; `{"type":"X"` at 9.
    let value_at = |i: usize| -> &[u8] { raw.get(i..).unwrap_or_default() };
    let discriminator = if raw.get(8) == Some(&b' ') {
        value_at(10)
    } else {
        value_at(9)
    };
    match discriminator {
        d if d.starts_with(b"R") => MessageKind::Record,
        d if d.starts_with(b"SC") => MessageKind::Schema,
        d if d.starts_with(b"ST") => MessageKind::State,
        _ => MessageKind::Other,
    }
}

/// A parsed STATE message payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    pub value: Value,
}

/// Parse a STATE line, returning its `value` field.
///
/// Returns `None` when the line is not valid JSON, not a STATE message, or
/// carries no `value`; the interceptor skips such lines rather than
/// failing the pipeline.
#[must_use]
pub fn parse_state_line(raw: &[u8]) -> Option<StateMessage> {
    let mut object: Map<String, Value> = serde_json::from_slice(raw).ok()?;
    if object.get("type").and_then(Value::as_str) != Some("STATE") {
        return None;
    }
    let value = object.remove("value")?;
    Some(StateMessage { value })
}

/// Parsed fields of a RECORD message the transformer needs.
pub struct RecordMessage {
    pub stream: String,
    pub object: Map<String, Value>,
}

impl RecordMessage {
    /// Parse a RECORD line into a mutable message.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let object: Map<String, Value> = serde_json::from_slice(raw).ok()?;
        if object.get("type").and_then(Value::as_str) != Some("RECORD") {
            return None;
        }
        let stream = object.get("stream")?.as_str()?.to_string();
        Some(Self { stream, object })
    }

    /// Mutable access to the `record` payload map.
    pub fn record_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.object.get_mut("record").and_then(Value::as_object_mut)
    }

    /// Re-serialize to a single line.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error; cannot fail for this type.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.object)
    }
}

/// The `stream` field of a SCHEMA or RECORD line, via a full parse.
#[must_use]
pub fn stream_of(raw: &[u8]) -> Option<String> {
    let object: Map<String, Value> = serde_json::from_slice(raw).ok()?;
    Some(object.get("stream")?.as_str()?.to_string())
}

/// The `schema` payload of a SCHEMA line, via a full parse.
#[must_use]
pub fn schema_of(raw: &[u8]) -> Option<Value> {
    let mut object: Map<String, Value> = serde_json::from_slice(raw).ok()?;
    object.remove("schema")
}
