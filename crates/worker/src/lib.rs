//! Deal queue worker: consumes `DealCreated` jobs and persists them.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use dealq_events::HandlerRegistry;
use dealq_infra::QueueConfig;
use dealq_infra::queue::Consumer;
use dealq_infra::read_model::{InMemoryDealStore, register_deal_store};
use dealq_infra::tarantool::{Connection, TarantoolTube};
use dealq_infra::workers::{DispatchLoop, DispatchStats};

/// Connect, run the dispatch loop until `shutdown` resolves, then close the
/// connection. The connection is closed on every path after it was opened.
pub async fn run<S>(config: QueueConfig, shutdown: S) -> anyhow::Result<DispatchStats>
where
    S: Future<Output = ()>,
{
    let connection = Connection::connect(config.address.clone(), config.connect.clone())
        .await
        .with_context(|| format!("connecting to tarantool at {}", config.address))?;
    let connection = Arc::new(connection);

    let tube = Arc::new(TarantoolTube::new(connection.clone(), config.tube.clone()));
    let consumer = Consumer::new(tube, config.take_timeout).with_ack_mode(config.ack_mode);

    let store = Arc::new(InMemoryDealStore::new());
    let mut registry = HandlerRegistry::new();
    register_deal_store(&mut registry, store.clone());

    let handle = DispatchLoop::new(consumer, registry, config.dispatch.clone()).spawn();
    info!(tube = %config.tube, address = %config.address, "worker running");

    shutdown.await;
    info!("shutdown requested");

    let stats = handle.shutdown().await;
    connection.close().await;
    info!(deals = store.len(), "worker stopped");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dealq_core::TubeName;

    #[tokio::test]
    async fn unreachable_broker_is_a_startup_error() {
        let address = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut config = QueueConfig::new(address.clone(), TubeName::parse("deals").unwrap());
        config.connect.max_reconnects = 0;
        config.connect.dial_timeout = Duration::from_millis(200);

        let err = run(config, std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains(&address));
    }
}
