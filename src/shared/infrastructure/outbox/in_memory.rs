use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::Tx;
use crate::shared::infrastructure::in_memory::{MemoryConn, RowKey};
use crate::shared::infrastructure::outbox::{
    OutboxEntry, OutboxReader, OutboxStatus, OutboxWriter,
};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryOutbox;

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self
    }

    /// Claim one row for this boundary, apply `change`, and stage the result.
    fn modify<R>(
        tx: &mut Tx<MemoryConn>,
        id: Uuid,
        change: impl FnOnce(&mut OutboxEntry) -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        tx.conn().with_tables(|tables, staged, session| {
            let mut entry = staged
                .visible_outbox(tables)
                .into_iter()
                .find(|e| e.id == id)
                .ok_or_else(|| LedgerError::not_found("outbox_entry", id))?;
            if !tables.claim(RowKey::Outbox(id), session) {
                return Err(LedgerError::concurrency(
                    "outbox_entry",
                    id,
                    i64::from(entry.retry_count),
                ));
            }
            let result = change(&mut entry)?;
            staged.put_outbox(entry);
            Ok(result)
        })
    }
}

#[async_trait]
impl OutboxWriter<MemoryConn> for InMemoryOutbox {
    async fn append(&self, tx: &mut Tx<MemoryConn>, entry: OutboxEntry) -> Result<(), LedgerError> {
        self.append_batch(tx, vec![entry]).await
    }

    async fn append_batch(
        &self,
        tx: &mut Tx<MemoryConn>,
        entries: Vec<OutboxEntry>,
    ) -> Result<(), LedgerError> {
        tx.conn().with_tables(|tables, staged, session| {
            let visible = staged.visible_outbox(tables);
            for entry in entries {
                if visible.iter().any(|e| e.id == entry.id)
                    || staged.outbox_inserts.iter().any(|e| e.id == entry.id)
                {
                    return Err(LedgerError::duplicate("outbox_entry", entry.id));
                }
                tables.claim(RowKey::Outbox(entry.id), session);
                staged.outbox_inserts.push(entry);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl OutboxReader<MemoryConn> for InMemoryOutbox {
    async fn dequeue_unpublished(
        &self,
        tx: &mut Tx<MemoryConn>,
        limit: u64,
    ) -> Result<Vec<OutboxEntry>, LedgerError> {
        Ok(tx.conn().with_tables(|tables, staged, session| {
            let mut claimed = Vec::new();
            for entry in staged.visible_outbox(tables) {
                if claimed.len() as u64 >= limit {
                    break;
                }
                if entry.status != OutboxStatus::Pending {
                    continue;
                }
                if tables.claim(RowKey::Outbox(entry.id), session) {
                    claimed.push(entry);
                }
            }
            claimed
        }))
    }

    async fn mark_published(&self, tx: &mut Tx<MemoryConn>, id: Uuid) -> Result<(), LedgerError> {
        Self::modify(tx, id, |entry| {
            entry.mark_published(Utc::now());
            Ok(())
        })
    }

    async fn mark_failed(
        &self,
        tx: &mut Tx<MemoryConn>,
        id: Uuid,
        reason: &str,
    ) -> Result<(), LedgerError> {
        Self::modify(tx, id, |entry| entry.mark_failed(reason, Utc::now()))
    }

    async fn mark_for_retry(&self, tx: &mut Tx<MemoryConn>, id: Uuid) -> Result<(), LedgerError> {
        Self::modify(tx, id, OutboxEntry::mark_for_retry)
    }

    async fn cleanup_published(
        &self,
        tx: &mut Tx<MemoryConn>,
        older_than: chrono::Duration,
    ) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - older_than;
        Ok(tx.conn().with_tables(|tables, staged, session| {
            let mut removed = 0;
            for entry in staged.visible_outbox(tables) {
                let expired = entry.status == OutboxStatus::Published
                    && entry.published_at.is_some_and(|at| at < cutoff);
                if expired && tables.claim(RowKey::Outbox(entry.id), session) {
                    staged.outbox_inserts.retain(|e| e.id != entry.id);
                    staged.outbox_updates.remove(&entry.id);
                    staged.outbox_deletes.insert(entry.id);
                    removed += 1;
                }
            }
            removed
        }))
    }

    async fn find_failed_retryable(
        &self,
        tx: &mut Tx<MemoryConn>,
        limit: u64,
    ) -> Result<Vec<OutboxEntry>, LedgerError> {
        Ok(tx.conn().with_tables(|tables, staged, session| {
            let mut rows: Vec<_> = staged
                .visible_outbox(tables)
                .into_iter()
                .filter(|e| e.is_requeueable())
                .filter(|e| !tables.claimed_by_other(&RowKey::Outbox(e.id), session))
                .collect();
            rows.sort_by_key(|e| e.failed_at);
            rows.truncate(limit as usize);
            rows
        }))
    }
}

#[cfg(test)]
mod in_memory_outbox_tests {
    use super::*;
    use crate::modules::wallets::core::events::WalletEvent;
    use crate::shared::core::domain_event::DomainEvent;
    use crate::shared::core::errors::RuleCode;
    use crate::shared::core::unit_of_work::{IsolationLevel, TransactionalStore};
    use crate::shared::infrastructure::in_memory::InMemoryStore;
    use crate::shared::infrastructure::outbox::MAX_OUTBOX_RETRIES;
    use rstest::{fixture, rstest};

    #[fixture]
    fn store() -> InMemoryStore {
        InMemoryStore::new()
    }

    fn entry(version: i64) -> OutboxEntry {
        let event = DomainEvent::new(
            Uuid::now_v7(),
            Utc::now(),
            WalletEvent::WalletLocked { version },
        );
        OutboxEntry::from_event(&event).unwrap()
    }

    async fn begin(store: &InMemoryStore) -> Tx<MemoryConn> {
        Tx::new(
            store.begin(IsolationLevel::default()).await.unwrap(),
            IsolationLevel::default(),
        )
    }

    async fn seed(store: &InMemoryStore, count: i64) -> Vec<OutboxEntry> {
        let entries: Vec<_> = (1..=count).map(entry).collect();
        let mut tx = begin(store).await;
        InMemoryOutbox::new()
            .append_batch(&mut tx, entries.clone())
            .await
            .unwrap();
        store.commit(tx.into_conn()).await.unwrap();
        entries
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_only_expose_entries_once_committed(store: InMemoryStore) {
        let mut tx = begin(&store).await;
        InMemoryOutbox::new().append(&mut tx, entry(1)).await.unwrap();
        assert!(store.outbox_entries().is_empty());
        drop(tx);
        assert!(store.outbox_entries().is_empty());
        seed(&store, 1).await;
        assert_eq!(store.outbox_entries().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_hand_out_disjoint_batches_to_concurrent_dequeuers(store: InMemoryStore) {
        let outbox = InMemoryOutbox::new();
        let seeded = seed(&store, 5).await;

        let mut first = begin(&store).await;
        let mut second = begin(&store).await;
        let a = outbox.dequeue_unpublished(&mut first, 3).await.unwrap();
        let b = outbox.dequeue_unpublished(&mut second, 3).await.unwrap();

        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|x| b.iter().all(|y| x.id != y.id)));
        let first_ids: Vec<_> = a.iter().map(|e| e.id).collect();
        let oldest: Vec<_> = seeded.iter().take(3).map(|e| e.id).collect();
        assert_eq!(first_ids, oldest);

        drop(first);
        let c = outbox.dequeue_unpublished(&mut second, 10).await.unwrap();
        assert_eq!(c.len(), 5);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_publish_idempotently_and_skip_published_rows(store: InMemoryStore) {
        let outbox = InMemoryOutbox::new();
        let seeded = seed(&store, 2).await;

        let mut tx = begin(&store).await;
        outbox.mark_published(&mut tx, seeded[0].id).await.unwrap();
        outbox.mark_published(&mut tx, seeded[0].id).await.unwrap();
        store.commit(tx.into_conn()).await.unwrap();

        let mut tx = begin(&store).await;
        let pending = outbox.dequeue_unpublished(&mut tx, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, seeded[1].id);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_requeue_a_failed_entry_until_the_ceiling(store: InMemoryStore) {
        let outbox = InMemoryOutbox::new();
        let id = seed(&store, 1).await[0].id;
        for _ in 0..MAX_OUTBOX_RETRIES {
            let mut tx = begin(&store).await;
            outbox.mark_failed(&mut tx, id, "sink down").await.unwrap();
            let _ = outbox.mark_for_retry(&mut tx, id).await;
            store.commit(tx.into_conn()).await.unwrap();
        }
        let stored = &store.outbox_entries()[0];
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.retry_count, MAX_OUTBOX_RETRIES);

        let mut tx = begin(&store).await;
        assert!(outbox.find_failed_retryable(&mut tx, 10).await.unwrap().is_empty());
        let err = outbox.mark_for_retry(&mut tx, id).await.unwrap_err();
        assert_eq!(err.rule_code(), Some(RuleCode::OutboxRetryLimitExceeded));
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_purge_only_expired_published_entries(store: InMemoryStore) {
        let outbox = InMemoryOutbox::new();
        let seeded = seed(&store, 3).await;
        let mut tx = begin(&store).await;
        outbox.mark_published(&mut tx, seeded[0].id).await.unwrap();
        outbox.mark_published(&mut tx, seeded[1].id).await.unwrap();
        store.commit(tx.into_conn()).await.unwrap();

        let mut tx = begin(&store).await;
        let kept = outbox
            .cleanup_published(&mut tx, chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(kept, 0);
        let removed = outbox
            .cleanup_published(&mut tx, chrono::Duration::zero() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        store.commit(tx.into_conn()).await.unwrap();
        let left = store.outbox_entries();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, seeded[2].id);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_report_unknown_entries(store: InMemoryStore) {
        let mut tx = begin(&store).await;
        let err = InMemoryOutbox::new()
            .mark_published(&mut tx, Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "outbox_entry", .. }));
    }
}
