use ledger_core::shared::application::unit_of_work::UnitOfWork;
use ledger_core::shared::config::LedgerConfig;
use ledger_core::shared::infrastructure::outbox::postgres::PgOutbox;
use ledger_core::shared::infrastructure::outbox::relay::{OutboxRelay, TracingEventSink};
use ledger_core::shared::infrastructure::postgres::PgStore;
use ledger_core::shared::telemetry::init_tracing;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = LedgerConfig::from_env()?;
    let store = Arc::new(PgStore::connect(&config.database_url, &config.pool).await?);
    store.migrate().await?;

    let relay = OutboxRelay::new(
        UnitOfWork::new(Arc::clone(&store), config.uow_config()),
        Arc::new(PgOutbox::new()),
        Arc::new(TracingEventSink),
        config.relay.clone(),
    );

    let (stop, shutdown) = watch::channel(false);
    let relay_task = tokio::spawn(async move { relay.run(shutdown).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    stop.send(true)?;
    relay_task.await?;
    Ok(())
}
