use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dealq_events::{DispatchError, Envelope, HandlerRegistry};

use crate::queue::{Consumer, Delivery, QueueError, Tube};

/// Loop tuning. Defaults: 250ms idle backoff, 1s error backoff.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub name: String,
    /// Pause after a take that returned no job.
    pub idle_backoff: Duration,
    /// Pause after a transport failure.
    pub error_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            name: "deal-dispatch".to_string(),
            idle_backoff: Duration::from_millis(250),
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopState {
    #[default]
    Idle,
    Processing,
    Stopped,
}

/// Counters kept by a running loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub jobs_taken: u64,
    pub jobs_persisted: u64,
    pub discarded_unknown: u64,
    /// Envelope or typed payload failed to decode or validate.
    pub discarded_invalid: u64,
    pub persistence_failures: u64,
    pub released: u64,
    pub transport_errors: u64,
    pub empty_polls: u64,
    pub state: LoopState,
}

/// Handle to observe and stop a spawned [`DispatchLoop`].
#[derive(Debug)]
pub struct DispatchHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<DispatchStats>,
    stats: Arc<Mutex<DispatchStats>>,
}

impl DispatchHandle {
    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> LoopState {
        self.stats().state
    }

    /// Ask the loop to stop at its next iteration boundary.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Cancel, then wait for the loop to finish its current job and stop.
    pub async fn shutdown(self) -> DispatchStats {
        self.cancel();
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "dispatch loop task failed");
                self.stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            }
        }
    }
}

/// Polls a consumer and routes each envelope through a handler registry.
///
/// States go `Idle -> Processing -> Idle` until cancelled, then `Stopped`.
/// Cancellation is checked before each take; an in-flight take or handler
/// always runs to completion. Backoff sleeps end early on cancellation.
///
/// Failures of a single job never stop the loop:
///
/// - transport errors: logged, then `error_backoff`
/// - empty take: `idle_backoff`
/// - unknown event type, decode or validation failure: logged and discarded
/// - persistence failure: logged; the job is released only in
///   [`AckMode::AfterHandling`](crate::queue::AckMode::AfterHandling),
///   followed by `error_backoff` before it can be retaken
pub struct DispatchLoop<T: Tube> {
    consumer: Consumer<T>,
    registry: HandlerRegistry,
    config: DispatchConfig,
    stats: Arc<Mutex<DispatchStats>>,
}

impl<T: Tube + 'static> DispatchLoop<T> {
    pub fn new(consumer: Consumer<T>, registry: HandlerRegistry, config: DispatchConfig) -> Self {
        Self {
            consumer,
            registry,
            config,
            stats: Arc::new(Mutex::new(DispatchStats::default())),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run on a tokio task; see [`DispatchHandle`].
    pub fn spawn(self) -> DispatchHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        DispatchHandle {
            shutdown,
            join,
            stats,
        }
    }

    /// Loop until `shutdown` carries `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DispatchStats {
        info!(
            worker = %self.config.name,
            tube = %self.consumer.tube_name(),
            ack_mode = ?self.consumer.ack_mode(),
            "dispatch loop started"
        );

        while !is_cancelled(&shutdown) {
            self.set_state(LoopState::Idle);

            let backoff = match self.consumer.next::<Envelope>().await {
                Ok(Some(delivery)) => {
                    self.set_state(LoopState::Processing);
                    self.process(delivery).await
                }
                Ok(None) => {
                    self.update(|s| s.empty_polls += 1);
                    Some(self.config.idle_backoff)
                }
                Err(QueueError::Decode { job_id, message, raw }) => {
                    warn!(
                        worker = %self.config.name,
                        job_id = ?job_id,
                        raw_payload = raw.as_deref().unwrap_or_default(),
                        error = %message,
                        "undecodable job discarded"
                    );
                    self.update(|s| {
                        s.jobs_taken += 1;
                        s.discarded_invalid += 1;
                    });
                    None
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(worker = %self.config.name, error = %e, "take failed; backing off");
                    } else {
                        error!(worker = %self.config.name, error = %e, "take failed; backing off");
                    }
                    self.update(|s| s.transport_errors += 1);
                    Some(self.config.error_backoff)
                }
            };

            if let Some(delay) = backoff {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        self.set_state(LoopState::Stopped);
        let stats = self.stats();
        info!(worker = %self.config.name, ?stats, "dispatch loop stopped");
        stats
    }

    /// Handle one delivery. Returns the backoff to apply before the next take:
    /// a released job is back at the head of the tube and would otherwise be
    /// retaken at once.
    async fn process(&self, delivery: Delivery<Envelope>) -> Option<Duration> {
        self.update(|s| s.jobs_taken += 1);
        let envelope = &delivery.body;
        let event_type = envelope.event_type();
        let raw_payload = envelope.payload();

        let outcome = self.registry.dispatch(envelope).await;
        let settle = match &outcome {
            Ok(()) => {
                debug!(job_id = %delivery.job_id, event_type, "event persisted");
                self.update(|s| s.jobs_persisted += 1);
                Settle::Ack
            }
            Err(DispatchError::UnknownEventType(_)) => {
                warn!(job_id = %delivery.job_id, event_type, raw_payload, "unknown event type discarded");
                self.update(|s| s.discarded_unknown += 1);
                Settle::Ack
            }
            Err(e @ (DispatchError::Decode(_) | DispatchError::Validation(_))) => {
                warn!(job_id = %delivery.job_id, event_type, raw_payload, error = %e, "invalid event discarded");
                self.update(|s| s.discarded_invalid += 1);
                Settle::Ack
            }
            Err(e @ DispatchError::Persistence(_)) => {
                error!(job_id = %delivery.job_id, event_type, raw_payload, error = %e, "persisting event failed");
                self.update(|s| s.persistence_failures += 1);
                Settle::Release
            }
        };

        if delivery.is_acknowledged() {
            return None;
        }

        let result = match settle {
            Settle::Ack => self.consumer.ack(delivery.job_id).await,
            Settle::Release => {
                let released = self.consumer.release(delivery.job_id).await;
                if released.is_ok() {
                    self.update(|s| s.released += 1);
                }
                released
            }
        };
        if let Err(e) = result {
            warn!(job_id = %delivery.job_id, ?settle, error = %e, "settling job failed");
            self.update(|s| s.transport_errors += 1);
            return Some(self.config.error_backoff);
        }
        match settle {
            Settle::Ack => None,
            Settle::Release => Some(self.config.error_backoff),
        }
    }

    fn set_state(&self, state: LoopState) {
        self.update(|s| s.state = state);
    }

    fn update(&self, f: impl FnOnce(&mut DispatchStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Release,
}

fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}
