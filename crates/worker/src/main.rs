use dealq_infra::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dealq_observability::init();

    let config = QueueConfig::from_env()?;

    let stats = dealq_worker::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await?;

    tracing::info!(?stats, "exiting");
    Ok(())
}
