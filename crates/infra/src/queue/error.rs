use thiserror::Error;

use dealq_core::JobId;
use dealq_events::EnvelopeError;

use crate::tarantool::IprotoError;

/// Failures surfaced by the publisher and consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Dial/reconnect attempts exhausted. Fatal at startup.
    #[error("connection error: {0}")]
    Connection(String),

    /// A `put`/`take`/`ack` round trip failed. Retryable with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The job or its payload could not be decoded. Never retryable.
    #[error("decode error: {message}")]
    Decode {
        job_id: Option<JobId>,
        message: String,
        /// Raw job metadata, kept for replay-by-inspection.
        raw: Option<String>,
    },

    /// The handle was closed (or never opened).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl QueueError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn decode(job_id: Option<JobId>, message: impl Into<String>, raw: Option<String>) -> Self {
        Self::Decode {
            job_id,
            message: message.into(),
            raw,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Transport(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, QueueError::Decode { .. })
    }
}

impl From<IprotoError> for QueueError {
    fn from(value: IprotoError) -> Self {
        match value {
            IprotoError::ConnectFailed { .. } => QueueError::Connection(value.to_string()),
            IprotoError::Shutdown => QueueError::InvalidState(value.to_string()),
            other => QueueError::Transport(other.to_string()),
        }
    }
}
