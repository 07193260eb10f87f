use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::DomainEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("event type must not be empty")]
    EmptyEventType,

    #[error("failed to serialize payload: {0}")]
    Serialize(String),
}

/// Outer wrapper for an event on the queue.
///
/// Wire format is a JSON object with exactly two fields:
///
/// ```text
/// {"event_type": "DealCreated", "payload": "{\"id\":\"d1\", ...}"}
/// ```
///
/// `payload` is itself a JSON document kept as a string, so the envelope can be
/// routed without knowing the payload schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    event_type: String,
    payload: String,
}

/// Decoding shape: both fields required, nothing else allowed.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    event_type: String,
    payload: String,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        Self::new(wire.event_type, wire.payload)
    }
}

impl Envelope {
    /// Build an envelope from an already-encoded JSON payload.
    pub fn new(
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(EnvelopeError::EmptyEventType);
        }
        Ok(Self {
            event_type,
            payload: payload.into(),
        })
    }

    /// Marshal `payload` to JSON and wrap it under `event_type`.
    pub fn wrap<P>(event_type: impl Into<String>, payload: &P) -> Result<Self, EnvelopeError>
    where
        P: Serialize + ?Sized,
    {
        let json = serde_json::to_string(payload)
            .map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        Self::new(event_type, json)
    }

    /// Wrap a typed domain event under its own type tag.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, EnvelopeError> {
        Self::wrap(E::EVENT_TYPE, event)
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Raw JSON payload, exactly as published.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Parse the raw payload into an arbitrary JSON-deserializable type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    pub fn into_parts(self) -> (String, String) {
        (self.event_type, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrap_stores_payload_as_json_string() {
        let env = Envelope::wrap("DealCreated", &json!({"id": "d1"})).unwrap();
        assert_eq!(env.event_type(), "DealCreated");
        assert_eq!(env.payload(), r#"{"id":"d1"}"#);

        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(
            wire,
            json!({"event_type": "DealCreated", "payload": "{\"id\":\"d1\"}"})
        );
    }

    #[test]
    fn empty_event_type_is_rejected() {
        assert_eq!(
            Envelope::new("", "{}").unwrap_err(),
            EnvelopeError::EmptyEventType
        );
    }

    #[test]
    fn decoding_applies_constructor_rules() {
        let ok: Envelope =
            serde_json::from_value(json!({"event_type": "DealCreated", "payload": "{}"})).unwrap();
        assert_eq!(ok, Envelope::new("DealCreated", "{}").unwrap());

        let empty = serde_json::from_value::<Envelope>(json!({"event_type": "", "payload": "{}"}));
        assert!(empty.unwrap_err().to_string().contains("must not be empty"));

        let extra = serde_json::from_value::<Envelope>(
            json!({"event_type": "DealCreated", "payload": "{}", "trace": "x"}),
        );
        assert!(extra.is_err());
    }
}
