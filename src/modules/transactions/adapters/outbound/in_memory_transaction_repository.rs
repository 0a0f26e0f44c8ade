use crate::modules::transactions::core::ports::{TransactionFilter, TransactionRepository};
use crate::modules::transactions::core::transaction::{
    Transaction, TransactionStatus, is_retryable_reason,
};
use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::Tx;
use crate::shared::infrastructure::in_memory::{MemoryConn, RowKey};
use async_trait::async_trait;
use std::cmp::Reverse;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryTransactionRepository;

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self
    }

    fn visible(tx: &mut Tx<MemoryConn>) -> Vec<Transaction> {
        tx.conn()
            .with_tables(|tables, staged, _| staged.visible_transactions(tables))
            .into_iter()
            .map(Transaction::restore)
            .collect()
    }
}

#[async_trait]
impl TransactionRepository<MemoryConn> for InMemoryTransactionRepository {
    async fn save(
        &self,
        tx: &mut Tx<MemoryConn>,
        transaction: &mut Transaction,
    ) -> Result<(), LedgerError> {
        let snapshot = transaction.snapshot();
        let expected = transaction.persisted_version();
        tx.conn().with_tables(|tables, staged, session| {
            let id = snapshot.id;
            match expected {
                None => {
                    if staged.transaction(tables, id).is_some() {
                        return Err(LedgerError::duplicate("transaction", id));
                    }
                    let key = snapshot.idempotency_key.clone();
                    let taken = tables.idempotency_keys.contains_key(&key)
                        || staged
                            .transactions
                            .values()
                            .any(|t| t.idempotency_key == key);
                    if taken || !tables.claim(RowKey::IdempotencyKey(key.clone()), session) {
                        return Err(LedgerError::duplicate("transaction", key));
                    }
                    tables.claim(RowKey::Transaction(id), session);
                }
                Some(expected) => {
                    if !tables.claim(RowKey::Transaction(id), session) {
                        return Err(LedgerError::concurrency("transaction", id, expected));
                    }
                    let current = staged
                        .transaction(tables, id)
                        .ok_or_else(|| LedgerError::not_found("transaction", id))?;
                    if current.version != expected {
                        return Err(LedgerError::concurrency("transaction", id, expected));
                    }
                }
            }
            staged.transactions.insert(id, snapshot);
            Ok(())
        })?;
        transaction.mark_persisted();
        Ok(())
    }

    async fn find_by_id(
        &self,
        tx: &mut Tx<MemoryConn>,
        id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        tx.conn()
            .with_tables(|tables, staged, _| staged.transaction(tables, id).cloned())
            .map(Transaction::restore)
            .ok_or_else(|| LedgerError::not_found("transaction", id))
    }

    async fn find_by_idempotency_key(
        &self,
        tx: &mut Tx<MemoryConn>,
        key: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        let found = tx.conn().with_tables(|tables, staged, _| {
            staged
                .transactions
                .values()
                .find(|t| t.idempotency_key == key)
                .or_else(|| {
                    tables
                        .idempotency_keys
                        .get(key)
                        .and_then(|id| tables.transactions.get(id))
                })
                .cloned()
        });
        Ok(found.map(Transaction::restore))
    }

    async fn find_by_wallet_id(
        &self,
        tx: &mut Tx<MemoryConn>,
        wallet_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut rows: Vec<_> = Self::visible(tx)
            .into_iter()
            .filter(|t| t.wallet_id() == wallet_id)
            .collect();
        rows.sort_by_key(|t| Reverse((t.created_at(), t.id())));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn find_pending_by_wallet(
        &self,
        tx: &mut Tx<MemoryConn>,
        wallet_id: Uuid,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(Self::visible(tx)
            .into_iter()
            .filter(|t| t.wallet_id() == wallet_id && t.status() == TransactionStatus::Pending)
            .collect())
    }

    async fn find_failed_retryable(
        &self,
        tx: &mut Tx<MemoryConn>,
        max_retries: u32,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut rows: Vec<_> = Self::visible(tx)
            .into_iter()
            .filter(|t| {
                t.status() == TransactionStatus::Failed
                    && t.retry_count() < max_retries
                    && t.failure_reason().is_none_or(is_retryable_reason)
            })
            .collect();
        rows.sort_by_key(|t| (t.updated_at(), t.id()));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn list(
        &self,
        tx: &mut Tx<MemoryConn>,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut rows: Vec<_> = Self::visible(tx)
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        rows.sort_by_key(|t| Reverse((t.created_at(), t.id())));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
