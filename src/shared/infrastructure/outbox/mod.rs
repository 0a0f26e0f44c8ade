// Transactional outbox: entries, lifecycle, and the ports used to write and drain them.
//
// Purpose
// - Persist outgoing events in the same atomic unit as the business change they describe, so a committed
//   fact always has its event and a rolled back one never does.
//
// Responsibilities
// - `OutboxWriter` is the write path, only ever called with the handle of an open unit of work.
// - `OutboxReader` is the read path used by a dispatcher: claim, acknowledge, fail, requeue, purge.
// - The entry lifecycle (PENDING -> PUBLISHED, PENDING -> FAILED -> PENDING bounded) lives on
//   `OutboxEntry` so every adapter applies the same rules.

use crate::shared::core::domain_event::{DomainEvent, EventPayload};
use crate::shared::core::errors::{LedgerError, RuleCode};
use crate::shared::core::unit_of_work::Tx;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod in_memory;
pub mod postgres;
pub mod relay;

/// Failed deliveries an entry may be requeued after, mirroring the transaction retry policy.
pub const MAX_OUTBOX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(LedgerError::validation(
                "status",
                format!("unknown outbox status '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_version: i32,
    pub payload: Json,
    pub status: OutboxStatus,
    pub partition_key: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl OutboxEntry {
    /// The entry id is the event id, so enqueueing the same event twice is detectable downstream.
    pub fn from_event<P: EventPayload>(event: &DomainEvent<P>) -> Result<Self, LedgerError> {
        Ok(Self {
            id: event.event_id,
            aggregate_type: P::AGGREGATE_TYPE.to_string(),
            aggregate_id: event.aggregate_id,
            event_type: event.event_type().to_string(),
            event_version: event.payload.event_version(),
            payload: serde_json::to_value(&event.payload)?,
            status: OutboxStatus::Pending,
            partition_key: event.aggregate_id.to_string(),
            created_at: event.occurred_at,
            published_at: None,
            failed_at: None,
            last_error: None,
            retry_count: 0,
        })
    }

    /// Returns whether anything changed; acknowledging twice is a no-op.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == OutboxStatus::Published {
            return false;
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        true
    }

    pub fn mark_failed(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status == OutboxStatus::Published {
            return Err(LedgerError::rule(
                RuleCode::OutboxEntryPublished,
                format!("outbox entry {} is already published", self.id),
            ));
        }
        self.status = OutboxStatus::Failed;
        self.failed_at = Some(now);
        self.last_error = Some(reason.to_string());
        self.retry_count += 1;
        Ok(())
    }

    pub fn mark_for_retry(&mut self) -> Result<(), LedgerError> {
        if self.status != OutboxStatus::Failed {
            return Err(LedgerError::rule(
                RuleCode::OutboxEntryNotFailed,
                format!("outbox entry {} is {}", self.id, self.status),
            ));
        }
        if self.retry_count >= MAX_OUTBOX_RETRIES {
            return Err(LedgerError::rule(
                RuleCode::OutboxRetryLimitExceeded,
                format!(
                    "outbox entry {} failed {} of {MAX_OUTBOX_RETRIES} allowed times",
                    self.id, self.retry_count
                ),
            ));
        }
        self.status = OutboxStatus::Pending;
        Ok(())
    }

    pub fn is_requeueable(&self) -> bool {
        self.status == OutboxStatus::Failed && self.retry_count < MAX_OUTBOX_RETRIES
    }
}

#[async_trait]
pub trait OutboxWriter<C: Send>: Send + Sync {
    async fn append(&self, tx: &mut Tx<C>, entry: OutboxEntry) -> Result<(), LedgerError>;

    async fn append_batch(&self, tx: &mut Tx<C>, entries: Vec<OutboxEntry>)
    -> Result<(), LedgerError>;
}

#[async_trait]
pub trait OutboxReader<C: Send>: Send + Sync {
    /// PENDING entries, oldest first, claimed for the lifetime of `tx`. Entries claimed by another open
    /// unit of work are skipped rather than waited for.
    async fn dequeue_unpublished(
        &self,
        tx: &mut Tx<C>,
        limit: u64,
    ) -> Result<Vec<OutboxEntry>, LedgerError>;

    async fn mark_published(&self, tx: &mut Tx<C>, id: Uuid) -> Result<(), LedgerError>;

    async fn mark_failed(&self, tx: &mut Tx<C>, id: Uuid, reason: &str) -> Result<(), LedgerError>;

    async fn mark_for_retry(&self, tx: &mut Tx<C>, id: Uuid) -> Result<(), LedgerError>;

    /// Purge PUBLISHED entries published more than `older_than` ago. Returns how many were removed.
    async fn cleanup_published(
        &self,
        tx: &mut Tx<C>,
        older_than: chrono::Duration,
    ) -> Result<u64, LedgerError>;

    /// FAILED entries still under the retry ceiling, oldest failure first.
    async fn find_failed_retryable(
        &self,
        tx: &mut Tx<C>,
        limit: u64,
    ) -> Result<Vec<OutboxEntry>, LedgerError>;
}

/// Translate recorded domain events into outbox entries and append them in one call.
pub async fn enqueue_events<C, W, P>(
    outbox: &W,
    tx: &mut Tx<C>,
    events: Vec<DomainEvent<P>>,
) -> Result<(), LedgerError>
where
    C: Send,
    W: OutboxWriter<C> + ?Sized,
    P: EventPayload,
{
    if events.is_empty() {
        return Ok(());
    }
    let entries = events
        .iter()
        .map(OutboxEntry::from_event)
        .collect::<Result<Vec<_>, _>>()?;
    outbox.append_batch(tx, entries).await
}
