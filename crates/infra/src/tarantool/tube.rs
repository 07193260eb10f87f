use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;
use tracing::instrument;

use dealq_core::{JobId, TubeName};

use super::connection::Connection;
use super::error::IprotoError;
use crate::queue::{QueueError, Tube};

/// A tube of the tarantool `queue` module, driven over a shared [`Connection`].
#[derive(Debug, Clone)]
pub struct TarantoolTube {
    connection: Arc<Connection>,
    name: TubeName,
    put_proc: String,
    take_proc: String,
    ack_proc: String,
    release_proc: String,
}

impl TarantoolTube {
    pub fn new(connection: Arc<Connection>, name: TubeName) -> Self {
        Self {
            put_proc: name.procedure("put"),
            take_proc: name.procedure("take"),
            ack_proc: name.procedure("ack"),
            release_proc: name.procedure("release"),
            connection,
            name,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

#[async_trait]
impl Tube for TarantoolTube {
    fn name(&self) -> &TubeName {
        &self.name
    }

    #[instrument(skip(self, data), fields(tube = %self.name))]
    async fn put(&self, data: Value) -> Result<(), QueueError> {
        self.connection.call(&self.put_proc, vec![data]).await?;
        Ok(())
    }

    /// The broker holds the request for up to `wait`, so the response
    /// deadline is `wait` plus the regular request timeout.
    ///
    /// If that deadline passes, the broker may still have marked a job taken
    /// for this session. The session is dropped so the broker releases it.
    #[instrument(skip(self), fields(tube = %self.name))]
    async fn take(&self, wait: Duration) -> Result<Value, QueueError> {
        let deadline = wait + self.connection.options().request_timeout;
        let reply = self
            .connection
            .call_with_timeout(&self.take_proc, vec![Value::F64(wait.as_secs_f64())], deadline)
            .await;
        match reply {
            Ok(reply) => Ok(reply),
            Err(e @ IprotoError::Timeout(_)) => {
                self.connection.reset("take reply timed out").await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(tube = %self.name))]
    async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        self.connection
            .call(&self.ack_proc, vec![Value::from(id.as_u64())])
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(tube = %self.name))]
    async fn release(&self, id: JobId) -> Result<(), QueueError> {
        self.connection
            .call(&self.release_proc, vec![Value::from(id.as_u64())])
            .await?;
        Ok(())
    }
}
