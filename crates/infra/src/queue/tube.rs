use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;

use dealq_core::{JobId, TubeName};

use super::error::QueueError;

/// One named queue on the broker.
///
/// `take` returns the raw reply so callers can tell an empty wait apart
/// from a malformed tuple; see [`super::Job::from_take_reply`].
#[async_trait]
pub trait Tube: Send + Sync {
    fn name(&self) -> &TubeName;

    /// Enqueue `data` as a ready job.
    async fn put(&self, data: Value) -> Result<(), QueueError>;

    /// Wait up to `wait` for a ready job and mark it taken.
    async fn take(&self, wait: Duration) -> Result<Value, QueueError>;

    /// Mark a taken job done.
    async fn ack(&self, id: JobId) -> Result<(), QueueError>;

    /// Return a taken job to the ready state.
    async fn release(&self, id: JobId) -> Result<(), QueueError>;
}

#[async_trait]
impl<T> Tube for Arc<T>
where
    T: Tube + ?Sized,
{
    fn name(&self) -> &TubeName {
        (**self).name()
    }

    async fn put(&self, data: Value) -> Result<(), QueueError> {
        (**self).put(data).await
    }

    async fn take(&self, wait: Duration) -> Result<Value, QueueError> {
        (**self).take(wait).await
    }

    async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        (**self).ack(id).await
    }

    async fn release(&self, id: JobId) -> Result<(), QueueError> {
        (**self).release(id).await
    }
}
