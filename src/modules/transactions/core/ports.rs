// Ports the transaction module needs from persistence.
//
// Responsibilities
// - `save` inserts or compare-and-swap updates a transaction. Inserting a second row for an existing
//   idempotency key fails with `Duplicate`, which callers treat as "re-read by key".
// - `find_by_idempotency_key` reports absence as `Ok(None)`: absence is the expected answer of the
//   idempotency check, not an error.

use crate::modules::transactions::core::transaction::{
    Transaction, TransactionStatus, TransactionType,
};
use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::Tx;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub wallet_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.wallet_id.is_none_or(|id| tx.wallet_id() == id)
            && self.status.is_none_or(|status| tx.status() == status)
            && self
                .transaction_type
                .is_none_or(|kind| tx.transaction_type() == kind)
            && self.created_after.is_none_or(|after| tx.created_at() >= after)
            && self.created_before.is_none_or(|before| tx.created_at() < before)
    }
}

#[async_trait]
pub trait TransactionRepository<C: Send>: Send + Sync {
    async fn save(&self, tx: &mut Tx<C>, transaction: &mut Transaction) -> Result<(), LedgerError>;

    async fn find_by_id(&self, tx: &mut Tx<C>, id: Uuid) -> Result<Transaction, LedgerError>;

    async fn find_by_idempotency_key(
        &self,
        tx: &mut Tx<C>,
        key: &str,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// Newest first.
    async fn find_by_wallet_id(
        &self,
        tx: &mut Tx<C>,
        wallet_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// PENDING transactions of one wallet, oldest first.
    async fn find_pending_by_wallet(
        &self,
        tx: &mut Tx<C>,
        wallet_id: Uuid,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// FAILED transactions with `retry_count < max_retries` and a retryable failure reason, least
    /// recently updated first.
    async fn find_failed_retryable(
        &self,
        tx: &mut Tx<C>,
        max_retries: u32,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Newest first.
    async fn list(
        &self,
        tx: &mut Tx<C>,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError>;
}
