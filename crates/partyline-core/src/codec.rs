//! Wire envelope codec.
//!
//! Outbound messages pass through untouched when they are raw strings or
//! absent, and are JSON-encoded otherwise. Inbound bytes decode into
//! [`Payload`] values; a failed parse comes back as a [`DecodeError`]
//! value rather than unwinding, and dispatch substitutes the error-shaped
//! payload from [`error_payload`] so every message still produces exactly
//! one handler notification.

use bytes::Bytes;
use serde_json::{Value, json};

use crate::errors::DecodeError;

/// Decoded message payload, uniform across the client and test doubles.
///
/// Object keys are always strings, so there is a single representation for
/// every consumer to match against.
pub type Payload = Value;

const SNIPPET_MAX: usize = 120;

/// Encode an outbound message body.
///
/// Total by construction: absent messages stay absent (no body on the
/// wire, not the string `null`), raw strings pass through verbatim, and
/// everything else is serialized as JSON.
#[must_use]
pub fn encode(message: Option<&Payload>) -> Option<Bytes> {
    match message {
        None => None,
        Some(Value::String(raw)) => Some(Bytes::copy_from_slice(raw.as_bytes())),
        Some(value) => {
            // Serializing a Value cannot fail: object keys are strings.
            let body = serde_json::to_vec(value).unwrap_or_default();
            Some(Bytes::from(body))
        }
    }
}

/// Decode an inbound message body.
///
/// Empty and literal `null` bodies decode to [`Value::Null`], the explicit
/// absence value, which stays distinguishable from a parse failure.
pub fn decode(bytes: &[u8]) -> Result<Payload, DecodeError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|source| DecodeError {
        source,
        snippet: snippet_of(bytes),
    })
}

/// The error-shaped payload delivered in place of a message that failed to
/// decode.
#[must_use]
pub fn error_payload(err: &DecodeError) -> Payload {
    json!({ "error": format!("failed to parse message body: {}", err.source) })
}

/// Run a message through encode-then-decode.
///
/// In-process doubles deliver through this so payloads look exactly like
/// they would after a real wire round trip: absent bodies become `Null`,
/// raw strings that are not valid JSON become the error-shaped payload.
#[must_use]
pub fn normalize(message: Option<&Payload>) -> Payload {
    match encode(message) {
        None => Value::Null,
        Some(bytes) => decode(&bytes).unwrap_or_else(|err| error_payload(&err)),
    }
}

fn snippet_of(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= SNIPPET_MAX {
        text.into_owned()
    } else {
        let mut snippet: String = text.chars().take(SNIPPET_MAX).collect();
        snippet.push_str("...");
        snippet
    }
}
