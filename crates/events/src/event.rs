use serde::Serialize;
use serde::de::DeserializeOwned;

use dealq_core::DomainResult;

use crate::envelope::Envelope;
use crate::handler::DispatchError;

/// A typed event that can travel inside an [`Envelope`].
///
/// Decoding happens in two steps so failures can be classified:
///
/// 1. the raw JSON is parsed into [`DomainEvent::Payload`] (structural; a
///    failure here is a decode error)
/// 2. [`DomainEvent::from_payload`] checks semantics such as timestamp
///    formats (a failure here is a validation error)
pub trait DomainEvent: Serialize + Send + Sync + Sized + 'static {
    /// Stable type tag used for routing (e.g. `"DealCreated"`).
    const EVENT_TYPE: &'static str;

    /// Structural shape of the payload as it appears on the wire.
    type Payload: DeserializeOwned + Send;

    fn from_payload(payload: Self::Payload) -> DomainResult<Self>;
}

/// Decode and validate the payload of `envelope` as `E`.
///
/// The envelope's `event_type` is not checked here; routing is the caller's job.
pub fn decode_event<E: DomainEvent>(envelope: &Envelope) -> Result<E, DispatchError> {
    let payload: E::Payload = envelope
        .decode_payload()
        .map_err(|e| DispatchError::Decode(e.to_string()))?;
    E::from_payload(payload).map_err(DispatchError::Validation)
}
