//! Event-type registration table.
//!
//! Each registered entry maps a type tag to a closure that decodes the typed
//! payload, validates it, and hands the result to a persistence step. The table
//! is populated once at startup; the dispatch loop only ever looks entries up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use dealq_core::DomainError;

use crate::envelope::Envelope;
use crate::event::{DomainEvent, decode_event};

/// The downstream store rejected a write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("persistence failed: {message}")]
pub struct PersistenceError {
    message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a taken envelope was not handled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No handler is registered for the envelope's type tag.
    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    /// The payload was not valid JSON for the selected schema.
    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// The payload parsed but is semantically invalid.
    #[error(transparent)]
    Validation(DomainError),

    #[error(transparent)]
    Persistence(PersistenceError),
}

impl DispatchError {
    /// Only persistence failures can succeed on a second attempt; everything
    /// else is a property of the message itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Persistence(_))
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send>>;

type BoxedHandler = Arc<dyn Fn(&Envelope) -> HandlerFuture + Send + Sync>;

/// Maps event type tags to decode-and-handle functions.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `E`.
    ///
    /// Registering the same type twice replaces the earlier handler.
    pub fn register<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PersistenceError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |envelope: &Envelope| -> HandlerFuture {
            let decoded = decode_event::<E>(envelope);
            let handler = handler.clone();
            Box::pin(async move {
                let event = decoded?;
                handler(event).await.map_err(DispatchError::Persistence)
            })
        });

        self.handlers.insert(E::EVENT_TYPE.to_string(), boxed);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route `envelope` to its handler and run it to completion.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(envelope.event_type())
            .ok_or_else(|| DispatchError::UnknownEventType(envelope.event_type().to_string()))?;
        handler(envelope).await
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<&str> = self.event_types().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("event_types", &types)
            .finish()
    }
}
