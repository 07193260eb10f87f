use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use dealq_core::{JobId, TubeName};

use super::error::QueueError;
use super::job::{Job, JobState};
use super::tube::Tube;

/// When a taken job is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack right after take, before decoding. At-most-once.
    #[default]
    Immediate,
    /// Leave the job taken; the caller acks or releases it.
    AfterHandling,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(AckMode::Immediate),
            "after_handling" | "after-handling" => Ok(AckMode::AfterHandling),
            other => Err(format!("unknown ack mode {other:?}")),
        }
    }
}

/// A job taken off the tube, with its decoded metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<B> {
    pub job_id: JobId,
    pub state: JobState,
    pub body: B,
    /// Raw metadata as JSON, for logging.
    pub raw: String,
    acknowledged: bool,
}

impl<B> Delivery<B> {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }
}

/// Takes and acknowledges jobs from one tube.
pub struct Consumer<T: Tube> {
    tube: Option<Arc<T>>,
    name: TubeName,
    take_timeout: Duration,
    ack_mode: AckMode,
}

impl<T: Tube> Consumer<T> {
    pub fn new(tube: Arc<T>, take_timeout: Duration) -> Self {
        Self {
            name: tube.name().clone(),
            tube: Some(tube),
            take_timeout,
            ack_mode: AckMode::default(),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn take_timeout(&self) -> Duration {
        self.take_timeout
    }

    pub fn tube_name(&self) -> &TubeName {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.tube.is_none()
    }

    /// Take the next job and decode its metadata into `B`.
    ///
    /// Returns `Ok(None)` when nothing became ready within the take timeout.
    /// In [`AckMode::Immediate`] the job is acked before decoding. A job that
    /// fails to decode is acked in either mode, so it never stays on the tube
    /// as a poison job. If the ack
    /// itself fails the job stays taken and a transport error is returned.
    #[instrument(skip(self), fields(tube = %self.name))]
    pub async fn next<B: DeserializeOwned>(&self) -> Result<Option<Delivery<B>>, QueueError> {
        let tube = self.tube()?;
        let reply = tube.take(self.take_timeout).await?;

        let job = match Job::from_take_reply(reply) {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(malformed) => {
                if let Some(id) = malformed.job_id {
                    warn!(job_id = %id, error = %malformed.error, "malformed job, acking to drop it");
                    tube.ack(id).await?;
                }
                return Err(malformed.error);
            }
        };

        let acknowledged = match self.ack_mode {
            AckMode::Immediate => {
                tube.ack(job.id).await?;
                true
            }
            AckMode::AfterHandling => false,
        };
        debug!(job_id = %job.id, acknowledged, "took job");

        let body = match job.decode::<B>() {
            Ok(body) => body,
            Err(e) => {
                if !acknowledged {
                    tube.ack(job.id).await?;
                }
                return Err(e);
            }
        };
        Ok(Some(Delivery {
            job_id: job.id,
            state: job.state,
            body,
            raw: job.raw_data(),
            acknowledged,
        }))
    }

    pub async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        self.tube()?.ack(id).await
    }

    pub async fn release(&self, id: JobId) -> Result<(), QueueError> {
        self.tube()?.release(id).await
    }

    /// Drop the tube handle. Later calls fail with [`QueueError::InvalidState`].
    pub fn close(&mut self) {
        self.tube = None;
    }

    fn tube(&self) -> Result<&Arc<T>, QueueError> {
        self.tube
            .as_ref()
            .ok_or_else(|| QueueError::invalid_state(format!("consumer for {} is closed", self.name)))
    }
}

impl<T: Tube> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tube", &self.name)
            .field("take_timeout", &self.take_timeout)
            .field("ack_mode", &self.ack_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
