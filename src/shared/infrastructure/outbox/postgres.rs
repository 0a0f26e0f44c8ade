use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::Tx;
use crate::shared::infrastructure::outbox::{
    MAX_OUTBOX_RETRIES, OutboxEntry, OutboxReader, OutboxWriter,
};
use crate::shared::infrastructure::postgres::{PgConn, codec_error, map_sqlx_error, to_i64};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, event_version, payload, \
     status, partition_key, created_at, published_at, failed_at, last_error, retry_count";

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: Uuid,
    event_type: String,
    event_version: i32,
    payload: serde_json::Value,
    status: String,
    partition_key: String,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_count: i32,
}

impl OutboxRow {
    fn into_entry(self) -> Result<OutboxEntry, LedgerError> {
        Ok(OutboxEntry {
            id: self.id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            event_version: self.event_version,
            payload: self.payload,
            status: self.status.parse().map_err(codec_error)?,
            partition_key: self.partition_key,
            created_at: self.created_at,
            published_at: self.published_at,
            failed_at: self.failed_at,
            last_error: self.last_error,
            retry_count: u32::try_from(self.retry_count).map_err(codec_error)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PgOutbox;

impl PgOutbox {
    pub fn new() -> Self {
        Self
    }

    /// Lock one row for a status change. A row locked by another boundary is a conflict, not a wait.
    async fn lock(tx: &mut Tx<PgConn>, id: Uuid) -> Result<OutboxEntry, LedgerError> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1 FOR UPDATE NOWAIT"
        ))
        .bind(id)
        .fetch_optional(&mut **tx.conn())
        .await;
        match row {
            Ok(Some(row)) => row.into_entry(),
            Ok(None) => Err(LedgerError::not_found("outbox_entry", id)),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                Err(LedgerError::concurrency("outbox_entry", id, 0))
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn store(tx: &mut Tx<PgConn>, entry: &OutboxEntry) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE outbox SET status = $1, published_at = $2, failed_at = $3, last_error = $4, \
             retry_count = $5 WHERE id = $6",
        )
        .bind(entry.status.as_str())
        .bind(entry.published_at)
        .bind(entry.failed_at)
        .bind(&entry.last_error)
        .bind(i32::try_from(entry.retry_count).map_err(codec_error)?)
        .bind(entry.id)
        .execute(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

const LOCK_NOT_AVAILABLE: &str = "55P03";

#[async_trait]
impl OutboxWriter<PgConn> for PgOutbox {
    async fn append(&self, tx: &mut Tx<PgConn>, entry: OutboxEntry) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO outbox ({OUTBOX_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(entry.id)
        .bind(&entry.aggregate_type)
        .bind(entry.aggregate_id)
        .bind(&entry.event_type)
        .bind(entry.event_version)
        .bind(&entry.payload)
        .bind(entry.status.as_str())
        .bind(&entry.partition_key)
        .bind(entry.created_at)
        .bind(entry.published_at)
        .bind(entry.failed_at)
        .bind(&entry.last_error)
        .bind(i32::try_from(entry.retry_count).map_err(codec_error)?)
        .execute(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn append_batch(
        &self,
        tx: &mut Tx<PgConn>,
        entries: Vec<OutboxEntry>,
    ) -> Result<(), LedgerError> {
        for entry in entries {
            self.append(tx, entry).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxReader<PgConn> for PgOutbox {
    async fn dequeue_unpublished(
        &self,
        tx: &mut Tx<PgConn>,
        limit: u64,
    ) -> Result<Vec<OutboxEntry>, LedgerError> {
        sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'PENDING' \
             ORDER BY created_at LIMIT $1 FOR UPDATE SKIP LOCKED"
        ))
        .bind(to_i64(limit))
        .fetch_all(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?
        .into_iter()
        .map(OutboxRow::into_entry)
        .collect()
    }

    async fn mark_published(&self, tx: &mut Tx<PgConn>, id: Uuid) -> Result<(), LedgerError> {
        let mut entry = Self::lock(tx, id).await?;
        if entry.mark_published(Utc::now()) {
            Self::store(tx, &entry).await?;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        tx: &mut Tx<PgConn>,
        id: Uuid,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let mut entry = Self::lock(tx, id).await?;
        entry.mark_failed(reason, Utc::now())?;
        Self::store(tx, &entry).await
    }

    async fn mark_for_retry(&self, tx: &mut Tx<PgConn>, id: Uuid) -> Result<(), LedgerError> {
        let mut entry = Self::lock(tx, id).await?;
        entry.mark_for_retry()?;
        Self::store(tx, &entry).await
    }

    async fn cleanup_published(
        &self,
        tx: &mut Tx<PgConn>,
        older_than: chrono::Duration,
    ) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - older_than;
        let deleted = sqlx::query(
            "DELETE FROM outbox WHERE id IN (\
               SELECT id FROM outbox WHERE status = 'PUBLISHED' AND published_at < $1 \
               FOR UPDATE SKIP LOCKED)",
        )
        .bind(cutoff)
        .execute(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?;
        Ok(deleted.rows_affected())
    }

    async fn find_failed_retryable(
        &self,
        tx: &mut Tx<PgConn>,
        limit: u64,
    ) -> Result<Vec<OutboxEntry>, LedgerError> {
        sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'FAILED' AND retry_count < $1 \
             ORDER BY failed_at LIMIT $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(i64::from(MAX_OUTBOX_RETRIES))
        .bind(to_i64(limit))
        .fetch_all(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?
        .into_iter()
        .map(OutboxRow::into_entry)
        .collect()
    }
}

#[cfg(test)]
mod postgres_outbox_tests {
    use super::*;
    use crate::shared::infrastructure::outbox::OutboxStatus;
    use rstest::rstest;

    #[rstest]
    fn it_should_rebuild_an_entry_from_its_row() {
        let row = OutboxRow {
            id: Uuid::now_v7(),
            aggregate_type: "wallet".to_string(),
            aggregate_id: Uuid::now_v7(),
            event_type: "WalletCredited".to_string(),
            event_version: 1,
            payload: serde_json::json!({ "type": "WalletCredited" }),
            status: "FAILED".to_string(),
            partition_key: "p".to_string(),
            created_at: Utc::now(),
            published_at: None,
            failed_at: Some(Utc::now()),
            last_error: Some("broker down".to_string()),
            retry_count: 2,
        };
        let entry = row.into_entry().unwrap();
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert_eq!(entry.retry_count, 2);
        assert!(entry.is_requeueable());
    }
}
