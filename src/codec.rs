//! Canonical event encoding
//!
//! One encoding for everything the envelope touches: log rows store it,
//! stream records replay it, the consumer decodes it. Canonical means the
//! same envelope always serializes to the same bytes: field order is the
//! struct declaration order, amounts are fixed-point decimal strings and
//! timestamps are integer milliseconds.

use serde_json::Value;

use crate::domain::EventEnvelope;

/// Encode an envelope into its canonical JSON value.
pub fn encode(envelope: &EventEnvelope) -> Result<Value, serde_json::Error> {
    serde_json::to_value(envelope)
}

/// Decode a stored or streamed JSON value back into an envelope.
pub fn decode(value: &Value) -> Result<EventEnvelope, serde_json::Error> {
    serde_json::from_value(value.clone())
}

/// Encode to the canonical string form, used where byte identity matters.
pub fn encode_string(envelope: &EventEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
