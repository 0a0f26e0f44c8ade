// Outbox relay: drains committed outbox entries into an event sink.
//
// Purpose
// - Turn "durably enqueued" into "delivered". Each batch is claimed, forwarded, and acknowledged inside
//   one boundary, so concurrent relays never forward the same entry at the same time.
//
// Responsibilities
// - Delivery is at-least-once: if the acknowledging boundary fails to commit, the entries stay PENDING
//   and are forwarded again by a later batch.
// - A sink refusal marks the entry FAILED; `requeue_failed` puts it back while under the retry ceiling.
// - `cleanup` purges PUBLISHED entries past the retention window.
//
// Boundaries
// - Ordering is only what the store gives: oldest first within a batch.

use crate::shared::application::unit_of_work::UnitOfWork;
use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::TransactionalStore;
use crate::shared::infrastructure::outbox::{OutboxEntry, OutboxReader};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("event rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), SinkError>;
}

/// Emits every entry as a structured log line. The default sink when no broker is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), SinkError> {
        tracing::info!(
            event_id = %entry.id,
            aggregate_type = %entry.aggregate_type,
            aggregate_id = %entry.aggregate_id,
            event_type = %entry.event_type,
            partition_key = %entry.partition_key,
            payload = %entry.payload,
            "event published"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub retention: chrono::Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(1_000),
            retention: chrono::Duration::hours(168),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

/// Cleanup runs once every this many polls.
const CLEANUP_EVERY_TICKS: u64 = 60;

pub struct OutboxRelay<TStore, TReader, TSink>
where
    TStore: TransactionalStore,
    TReader: OutboxReader<TStore::Conn> + 'static,
    TSink: EventSink + 'static,
{
    uow: UnitOfWork<TStore>,
    reader: Arc<TReader>,
    sink: Arc<TSink>,
    config: RelayConfig,
}

impl<TStore, TReader, TSink> OutboxRelay<TStore, TReader, TSink>
where
    TStore: TransactionalStore,
    TReader: OutboxReader<TStore::Conn> + 'static,
    TSink: EventSink + 'static,
{
    pub fn new(
        uow: UnitOfWork<TStore>,
        reader: Arc<TReader>,
        sink: Arc<TSink>,
        config: RelayConfig,
    ) -> Self {
        Self {
            uow,
            reader,
            sink,
            config,
        }
    }

    pub async fn relay_batch(&self) -> Result<RelayReport, LedgerError> {
        let reader = Arc::clone(&self.reader);
        let sink = Arc::clone(&self.sink);
        let batch_size = self.config.batch_size;
        let report = self
            .uow
            .execute_with_result(move |tx| {
                Box::pin(async move {
                    let entries = reader.dequeue_unpublished(tx, batch_size).await?;
                    let mut report = RelayReport::default();
                    for entry in entries {
                        match sink.publish(&entry).await {
                            Ok(()) => {
                                reader.mark_published(tx, entry.id).await?;
                                report.published += 1;
                            }
                            Err(err) => {
                                tracing::warn!(event_id = %entry.id, error = %err, "sink refused event");
                                reader.mark_failed(tx, entry.id, &err.to_string()).await?;
                                report.failed += 1;
                            }
                        }
                    }
                    Ok(report)
                })
            })
            .await?;
        if report != RelayReport::default() {
            tracing::debug!(
                published = report.published,
                failed = report.failed,
                "outbox batch relayed"
            );
        }
        Ok(report)
    }

    /// Return FAILED entries still under the retry ceiling to PENDING.
    pub async fn requeue_failed(&self) -> Result<usize, LedgerError> {
        let reader = Arc::clone(&self.reader);
        let batch_size = self.config.batch_size;
        self.uow
            .execute_with_result(move |tx| {
                Box::pin(async move {
                    let failed = reader.find_failed_retryable(tx, batch_size).await?;
                    for entry in &failed {
                        reader.mark_for_retry(tx, entry.id).await?;
                    }
                    Ok(failed.len())
                })
            })
            .await
    }

    pub async fn cleanup(&self) -> Result<u64, LedgerError> {
        let reader = Arc::clone(&self.reader);
        let retention = self.config.retention;
        let removed = self
            .uow
            .execute_with_result(move |tx| {
                Box::pin(async move { reader.cleanup_published(tx, retention).await })
            })
            .await?;
        if removed > 0 {
            tracing::info!(removed, "published outbox entries purged");
        }
        Ok(removed)
    }

    /// Poll until `shutdown` flips to true or its sender goes away. Errors of one round are logged and
    /// the next round is attempted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox relay started"
        );
        // `interval` panics on a zero period.
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    self.round(ticks).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox relay stopped");
    }

    async fn round(&self, tick: u64) {
        if let Err(err) = self.relay_batch().await {
            tracing::error!(error = %err, "outbox relay batch failed");
        }
        match self.requeue_failed().await {
            Ok(0) => {}
            Ok(requeued) => tracing::debug!(requeued, "failed outbox entries requeued"),
            Err(err) => tracing::error!(error = %err, "outbox requeue failed"),
        }
        if tick % CLEANUP_EVERY_TICKS == 0 {
            if let Err(err) = self.cleanup().await {
                tracing::error!(error = %err, "outbox cleanup failed");
            }
        }
    }
}
