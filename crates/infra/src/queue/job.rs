//! Job tuples as returned by the tube procedures.

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use dealq_core::JobId;

use super::codec::to_json;
use super::error::QueueError;

/// Task status codes of the tarantool `queue` module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    Taken,
    Done,
    Buried,
    Delayed,
}

impl JobState {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "r" => Some(Self::Ready),
            "t" => Some(Self::Taken),
            "-" => Some(Self::Done),
            "!" => Some(Self::Buried),
            "~" => Some(Self::Delayed),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Ready => "r",
            Self::Taken => "t",
            Self::Done => "-",
            Self::Buried => "!",
            Self::Delayed => "~",
        }
    }
}

/// One job: `[id, state, metadata]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    /// Metadata map; holds the envelope fields, `payload` among them.
    pub data: Value,
}

/// A take reply that could not be turned into a [`Job`].
///
/// `job_id` is set when the id was readable, so the job can still be acked.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedJob {
    pub job_id: Option<JobId>,
    pub error: QueueError,
}

impl Job {
    pub fn new(id: JobId, state: JobState, data: Value) -> Self {
        Self { id, state, data }
    }

    pub fn to_tuple(&self) -> Value {
        Value::Array(vec![
            Value::from(self.id.as_u64()),
            Value::from(self.state.code()),
            self.data.clone(),
        ])
    }

    /// Parse the reply of a `take` call.
    ///
    /// `[]`, `nil` and `[nil]` mean no job was ready within the wait.
    pub fn from_take_reply(reply: Value) -> Result<Option<Job>, MalformedJob> {
        let items = match reply {
            Value::Nil => return Ok(None),
            Value::Array(items) => items,
            other => {
                return Err(malformed(None, format!("take reply is not an array: {}", other), None));
            }
        };

        let nested = match items.first() {
            None | Some(Value::Nil) => return Ok(None),
            Some(first) => first.is_array(),
        };
        let tuple = if nested {
            items.into_iter().next().unwrap_or(Value::Nil)
        } else {
            // Procedure returned the tuple fields as separate values.
            Value::Array(items)
        };

        Self::from_tuple(tuple).map(Some)
    }

    pub fn from_tuple(tuple: Value) -> Result<Job, MalformedJob> {
        let raw = Some(tuple.to_string());
        let Value::Array(fields) = tuple else {
            return Err(malformed(None, "job tuple is not an array", raw));
        };

        let id = fields
            .first()
            .and_then(Value::as_u64)
            .map(JobId::new)
            .ok_or_else(|| malformed(None, "job tuple has no numeric id", raw.clone()))?;

        if fields.len() != 3 {
            return Err(malformed(
                Some(id),
                format!("job tuple has {} fields, expected 3", fields.len()),
                raw,
            ));
        }

        let state = fields[1]
            .as_str()
            .and_then(JobState::from_code)
            .ok_or_else(|| {
                malformed(Some(id), format!("unknown job state {}", fields[1]), raw.clone())
            })?;

        let mut fields = fields;
        let data = fields.pop().unwrap_or(Value::Nil);
        Ok(Job { id, state, data })
    }

    /// The `payload` string carried in the metadata.
    pub fn payload(&self) -> Result<&str, QueueError> {
        self.data
            .as_map()
            .and_then(|entries| entries.iter().find(|(k, _)| k.as_str() == Some("payload")))
            .and_then(|(_, v)| v.as_str())
            .ok_or_else(|| self.decode_error("metadata has no string `payload` field"))
    }

    /// Decode the metadata map into `T`.
    ///
    /// The map must carry a string `payload`; its remaining fields (for an
    /// envelope: `event_type`) are decoded alongside it.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        self.payload()?;
        let json = to_json(&self.data).map_err(|e| self.decode_error(e))?;
        serde_json::from_value(json).map_err(|e| self.decode_error(e.to_string()))
    }

    /// Metadata rendered for logs.
    pub fn raw_data(&self) -> String {
        match to_json(&self.data) {
            Ok(json) => json.to_string(),
            Err(_) => self.data.to_string(),
        }
    }

    fn decode_error(&self, message: impl Into<String>) -> QueueError {
        QueueError::decode(Some(self.id), message, Some(self.raw_data()))
    }
}

fn malformed(job_id: Option<JobId>, message: impl Into<String>, raw: Option<String>) -> MalformedJob {
    MalformedJob {
        job_id,
        error: QueueError::decode(job_id, message, raw),
    }
}
