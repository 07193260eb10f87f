//! Domain events carried over the job queue.
//!
//! - [`Envelope`]: the outer `{event_type, payload}` wrapper that travels on the wire
//! - [`DomainEvent`]: typed events with a stable type tag and a validated decode step
//! - [`HandlerRegistry`]: event-type → decode-and-handle table populated at startup

pub mod deal;
pub mod envelope;
pub mod event;
pub mod handler;

pub use deal::{DealCreated, DealCreatedPayload};
pub use envelope::{Envelope, EnvelopeError};
pub use event::{DomainEvent, decode_event};
pub use handler::{DispatchError, HandlerFuture, HandlerRegistry, PersistenceError};
