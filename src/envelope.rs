//! Wire envelope codec
//!
//! Textual frames carry a JSON envelope `{"event": <string>, "data": <any>}`.
//! Binary frames carry no envelope and are delivered under the synthetic
//! event name [`BUFFER_EVENT`]; text that fails to decode is delivered under
//! [`ERROR_EVENT`] with the raw text as payload. Decoding into a concrete
//! payload shape is the caller's responsibility.

use crate::errors::HubResult;
use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synthetic event name for binary frames.
pub const BUFFER_EVENT: &str = "buffer";

/// Synthetic event name for undecodable text frames.
pub const ERROR_EVENT: &str = "error";

/// Event name used by the liveness protocol.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Local-only event dispatched once when a connection reaches `Closed`.
pub const CLOSE_EVENT: &str = "close";

/// The `{event, data}` wire unit for textual frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new<T: Into<String>>(event: T, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize into a text frame.
    pub fn to_message(&self) -> HubResult<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }

    /// Heartbeat envelopes have a fixed shape, so encoding cannot fail.
    pub(crate) fn heartbeat(kind: &str) -> Message {
        Message::Text(format!(
            "{{\"event\":\"{}\",\"data\":\"{}\"}}",
            HEARTBEAT_EVENT, kind
        ))
    }
}

/// Payload delivered with an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Decoded `data` field of a well-formed envelope.
    Json(Value),
    /// Raw bytes of a binary frame.
    Binary(Vec<u8>),
    /// Raw text of a frame that failed envelope decoding.
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// String view of a JSON string payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Json(Value::String(s)) => Some(s),
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub event: String,
    pub payload: Payload,
}

impl Inbound {
    /// Classify a text frame. Malformed JSON (or JSON without an `event`
    /// string) falls back to the `"error"` event carrying the raw text.
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => Inbound {
                event: envelope.event,
                payload: Payload::Json(envelope.data),
            },
            Err(_) => Inbound {
                event: ERROR_EVENT.to_string(),
                payload: Payload::Text(text.to_string()),
            },
        }
    }

    /// Classify a binary frame.
    pub fn from_binary(bytes: Vec<u8>) -> Self {
        Inbound {
            event: BUFFER_EVENT.to_string(),
            payload: Payload::Binary(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_well_formed_envelope() {
        let inbound = Inbound::from_text(r#"{"event":"chat","data":{"text":"hi"}}"#);
        assert_eq!(inbound.event, "chat");
        assert_eq!(inbound.payload, Payload::Json(json!({"text": "hi"})));
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let inbound = Inbound::from_text(r#"{"event":"ping"}"#);
        assert_eq!(inbound.event, "ping");
        assert_eq!(inbound.payload, Payload::Json(Value::Null));
    }

    #[test]
    fn malformed_json_becomes_error_event() {
        let inbound = Inbound::from_text("not json at all");
        assert_eq!(inbound.event, ERROR_EVENT);
        assert_eq!(inbound.payload, Payload::Text("not json at all".to_string()));
    }

    #[test]
    fn envelope_without_event_becomes_error_event() {
        let inbound = Inbound::from_text(r#"{"data":1}"#);
        assert_eq!(inbound.event, ERROR_EVENT);
        assert_eq!(inbound.payload, Payload::Text(r#"{"data":1}"#.to_string()));
    }

    #[test]
    fn binary_frames_use_buffer_event() {
        let inbound = Inbound::from_binary(vec![1, 2, 3]);
        assert_eq!(inbound.event, BUFFER_EVENT);
        assert_eq!(inbound.payload, Payload::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn encodes_envelope_as_text_frame() {
        let message = Envelope::new("ping", json!(1)).to_message().unwrap();
        assert_eq!(message, Message::Text(r#"{"event":"ping","data":1}"#.to_string()));
    }

    #[test]
    fn heartbeat_shape_round_trips() {
        let message = Envelope::heartbeat("ping");
        let Message::Text(text) = message else {
            panic!("heartbeat must be a text frame");
        };
        let inbound = Inbound::from_text(&text);
        assert_eq!(inbound.event, HEARTBEAT_EVENT);
        assert_eq!(inbound.payload.as_str(), Some("ping"));
    }
}
