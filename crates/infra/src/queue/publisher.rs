use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, instrument};

use dealq_core::TubeName;
use dealq_events::{DomainEvent, Envelope};

use super::codec::from_json;
use super::error::QueueError;
use super::tube::Tube;

/// Puts enveloped events on a tube.
///
/// Safe to share across tasks; `close` is idempotent and every publish after
/// it fails with [`QueueError::InvalidState`].
pub struct Publisher<T: Tube> {
    name: TubeName,
    tube: RwLock<Option<Arc<T>>>,
}

impl<T: Tube> Publisher<T> {
    pub fn new(tube: Arc<T>) -> Self {
        Self {
            name: tube.name().clone(),
            tube: RwLock::new(Some(tube)),
        }
    }

    pub fn tube_name(&self) -> &TubeName {
        &self.name
    }

    /// Marshal `payload` to JSON, wrap it as `{event_type, payload}` and put it.
    pub async fn publish<P>(&self, event_type: &str, payload: &P) -> Result<(), QueueError>
    where
        P: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::wrap(event_type, payload)?;
        self.publish_envelope(&envelope).await
    }

    pub async fn publish_event<E: DomainEvent>(&self, event: &E) -> Result<(), QueueError> {
        let envelope = Envelope::from_event(event)?;
        self.publish_envelope(&envelope).await
    }

    #[instrument(skip(self, envelope), fields(tube = %self.name, event_type = %envelope.event_type()))]
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let tube = self.current()?;
        let json = serde_json::to_value(envelope)
            .map_err(|e| QueueError::Envelope(dealq_events::EnvelopeError::Serialize(e.to_string())))?;
        tube.put(from_json(&json)).await?;
        debug!("published");
        Ok(())
    }

    pub fn close(&self) {
        if let Ok(mut tube) = self.tube.write() {
            tube.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tube.read().map(|t| t.is_none()).unwrap_or(true)
    }

    fn current(&self) -> Result<Arc<T>, QueueError> {
        self.tube
            .read()
            .ok()
            .and_then(|t| t.clone())
            .ok_or_else(|| QueueError::invalid_state(format!("publisher for {} is closed", self.name)))
    }
}

impl<T: Tube> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("tube", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryTube, Job};
    use serde_json::json;
    use std::time::Duration;

    fn publisher() -> (Arc<InMemoryTube>, Publisher<InMemoryTube>) {
        let tube = Arc::new(InMemoryTube::new(TubeName::parse("deals").unwrap()));
        (tube.clone(), Publisher::new(tube))
    }

    #[tokio::test]
    async fn publish_puts_envelope_metadata() {
        let (tube, publisher) = publisher();
        publisher
            .publish("DealCreated", &json!({"id": "d1"}))
            .await
            .unwrap();

        let job = Job::from_take_reply(tube.take(Duration::ZERO).await.unwrap())
            .unwrap()
            .unwrap();
        let envelope: Envelope = job.decode().unwrap();
        assert_eq!(envelope.event_type(), "DealCreated");
        assert_eq!(envelope.payload(), r#"{"id":"d1"}"#);
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let (tube, publisher) = publisher();
        let err = publisher.publish("", &json!({})).await.unwrap_err();

        assert!(matches!(err, QueueError::Envelope(_)));
        assert_eq!(tube.ready_len(), 0);
    }

    #[tokio::test]
    async fn closed_publisher_rejects_publish() {
        let (tube, publisher) = publisher();
        publisher.close();
        publisher.close();

        assert!(publisher.is_closed());
        let err = publisher.publish("DealCreated", &json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState(_)));
        assert_eq!(tube.ready_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_publishes_all_land() {
        let (tube, publisher) = publisher();
        let publisher = Arc::new(publisher);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let publisher = publisher.clone();
                tokio::spawn(async move { publisher.publish("Tick", &json!({ "n": i })).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(tube.ready_len(), 16);
    }
}
