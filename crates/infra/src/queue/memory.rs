//! Process-local tube, used by tests and local runs without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use dealq_core::{JobId, TubeName};

use super::error::QueueError;
use super::job::{Job, JobState};
use super::tube::Tube;

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<(JobId, Value)>,
    taken: HashMap<JobId, Value>,
    acked: u64,
}

#[derive(Debug)]
pub struct InMemoryTube {
    name: TubeName,
    state: Mutex<State>,
    ready: Notify,
    next_id: AtomicU64,
}

impl InMemoryTube {
    pub fn new(name: TubeName) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or_default()
    }

    pub fn taken_len(&self) -> usize {
        self.lock().map(|s| s.taken.len()).unwrap_or_default()
    }

    pub fn acked(&self) -> u64 {
        self.lock().map(|s| s.acked).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::transport("in-memory tube lock poisoned"))
    }

    fn try_take(&self) -> Result<Option<Job>, QueueError> {
        let mut state = self.lock()?;
        let Some((id, data)) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.taken.insert(id, data.clone());
        Ok(Some(Job::new(id, JobState::Taken, data)))
    }
}

#[async_trait]
impl Tube for InMemoryTube {
    fn name(&self) -> &TubeName {
        &self.name
    }

    async fn put(&self, data: Value) -> Result<(), QueueError> {
        let id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock()?.ready.push_back((id, data));
        self.ready.notify_one();
        Ok(())
    }

    async fn take(&self, wait: Duration) -> Result<Value, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            if let Some(job) = self.try_take()? {
                return Ok(Value::Array(vec![job.to_tuple()]));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Value::Array(Vec::new()));
            }
        }
    }

    async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.taken.remove(&id).is_none() {
            return Err(QueueError::transport(format!("job {id} is not taken")));
        }
        state.acked += 1;
        Ok(())
    }

    async fn release(&self, id: JobId) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let Some(data) = state.taken.remove(&id) else {
                return Err(QueueError::transport(format!("job {id} is not taken")));
            };
            state.ready.push_front((id, data));
        }
        self.ready.notify_one();
        Ok(())
    }
}
