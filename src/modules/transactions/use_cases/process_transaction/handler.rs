// Drives recorded transactions through their wallets.
//
// Responsibilities
// - `process` moves a PENDING transaction's money and completes it in one boundary: the wallet change,
//   the transaction change and all their events commit together.
// - PAYOUT is two-phase: `process` reserves the funds and leaves the transaction PROCESSING until
//   `settle_payout` or `fail_payout`.
// - When a wallet refuses the movement, that boundary rolls back entirely and a second boundary records
//   the transaction as FAILED with a reason code. The failure is an outcome, not an error.
// - `retry_failed` returns retryable FAILED transactions to PENDING.

use crate::modules::transactions::core::ports::TransactionRepository;
use crate::modules::transactions::core::transaction::{
    Transaction, TransactionStatus, TransactionType,
};
use crate::modules::wallets::core::ports::WalletRepository;
use crate::modules::wallets::core::wallet::Wallet;
use crate::shared::application::unit_of_work::UnitOfWork;
use crate::shared::core::errors::{LedgerError, RuleCode};
use crate::shared::core::unit_of_work::{TransactionalStore, Tx};
use crate::shared::infrastructure::outbox::{OutboxWriter, enqueue_events};
use std::sync::Arc;
use uuid::Uuid;

/// Failure reason recorded when a wallet refuses a movement, or `None` when the error is not the
/// wallet's verdict and must propagate instead.
pub fn failure_reason(err: &LedgerError) -> Option<&'static str> {
    match err {
        LedgerError::BusinessRule { code, .. } => match code {
            RuleCode::InsufficientBalance => Some("INSUFFICIENT_BALANCE"),
            RuleCode::WalletClosed => Some("ACCOUNT_CLOSED"),
            RuleCode::WalletNotActive => Some("WALLET_NOT_ACTIVE"),
            RuleCode::CurrencyMismatch => Some("INVALID_ACCOUNT"),
            _ => None,
        },
        LedgerError::NotFound {
            entity: "wallet", ..
        } => Some("INVALID_ACCOUNT"),
        LedgerError::Validation {
            field: "destination_wallet_id",
            ..
        } => Some("INVALID_ACCOUNT"),
        _ => None,
    }
}

pub struct ProcessTransactionHandler<TStore, TWallets, TTransactions, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TTransactions: TransactionRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    uow: UnitOfWork<TStore>,
    wallets: Arc<TWallets>,
    transactions: Arc<TTransactions>,
    outbox: Arc<TOutbox>,
    max_retries: u32,
}

impl<TStore, TWallets, TTransactions, TOutbox> Clone
    for ProcessTransactionHandler<TStore, TWallets, TTransactions, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TTransactions: TransactionRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            uow: self.uow.clone(),
            wallets: Arc::clone(&self.wallets),
            transactions: Arc::clone(&self.transactions),
            outbox: Arc::clone(&self.outbox),
            max_retries: self.max_retries,
        }
    }
}

impl<TStore, TWallets, TTransactions, TOutbox>
    ProcessTransactionHandler<TStore, TWallets, TTransactions, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TTransactions: TransactionRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    pub fn new(
        uow: UnitOfWork<TStore>,
        wallets: Arc<TWallets>,
        transactions: Arc<TTransactions>,
        outbox: Arc<TOutbox>,
        max_retries: u32,
    ) -> Self {
        Self {
            uow,
            wallets,
            transactions,
            outbox,
            max_retries,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn process(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        let this = self.clone();
        let result = self
            .uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                Box::pin(async move { this.process_in(tx, transaction_id).await })
            })
            .await;
        match result {
            Ok(transaction) => {
                tracing::info!(status = %transaction.status(), "transaction processed");
                Ok(transaction)
            }
            Err(err) => match failure_reason(&err) {
                Some(reason) => {
                    tracing::warn!(reason, error = %err, "movement refused, recording failure");
                    self.record_failure(transaction_id, reason).await
                }
                None => Err(err),
            },
        }
    }

    /// Process inside a boundary the caller already holds. Wallet refusals are returned as errors here;
    /// only `process` turns them into a FAILED transaction.
    pub async fn process_in(
        &self,
        tx: &mut Tx<TStore::Conn>,
        transaction_id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        let mut transaction = self.transactions.find_by_id(tx, transaction_id).await?;
        transaction.start_processing()?;
        let amount = transaction.amount().clone();

        match transaction.transaction_type() {
            TransactionType::Deposit | TransactionType::Refund | TransactionType::Adjustment => {
                self.move_funds(tx, transaction.wallet_id(), |w| w.credit(&amount))
                    .await?;
                transaction.mark_completed()?;
            }
            TransactionType::Withdraw | TransactionType::Fee => {
                self.move_funds(tx, transaction.wallet_id(), |w| w.debit(&amount))
                    .await?;
                transaction.mark_completed()?;
            }
            TransactionType::Transfer => {
                let destination = transaction.destination_wallet_id().ok_or_else(|| {
                    LedgerError::validation("destination_wallet_id", "transfer has no destination")
                })?;
                self.move_funds(tx, transaction.wallet_id(), |w| w.debit(&amount))
                    .await?;
                self.move_funds(tx, destination, |w| w.credit(&amount))
                    .await?;
                transaction.mark_completed()?;
            }
            TransactionType::Payout => {
                self.move_funds(tx, transaction.wallet_id(), |w| w.reserve(&amount))
                    .await?;
            }
        }

        self.save_transaction(tx, &mut transaction).await?;
        Ok(transaction)
    }

    /// Second phase of a PAYOUT that went through: reserved funds leave the wallet for good.
    #[tracing::instrument(skip(self))]
    pub async fn settle_payout(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        let this = self.clone();
        self.uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                Box::pin(async move {
                    let mut transaction = this.load_payout(tx, transaction_id).await?;
                    transaction.mark_completed()?;
                    let amount = transaction.amount().clone();
                    this.move_funds(tx, transaction.wallet_id(), |w| w.complete_pending(&amount))
                        .await?;
                    this.save_transaction(tx, &mut transaction).await?;
                    Ok(transaction)
                })
            })
            .await
    }

    /// Second phase of a PAYOUT that was refused downstream: reserved funds return to `available`.
    #[tracing::instrument(skip(self))]
    pub async fn fail_payout(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<Transaction, LedgerError> {
        let this = self.clone();
        let reason = reason.to_string();
        self.uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                let reason = reason.clone();
                Box::pin(async move {
                    let mut transaction = this.load_payout(tx, transaction_id).await?;
                    transaction.mark_failed(reason)?;
                    let amount = transaction.amount().clone();
                    this.move_funds(tx, transaction.wallet_id(), |w| w.release(&amount))
                        .await?;
                    this.save_transaction(tx, &mut transaction).await?;
                    Ok(transaction)
                })
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        let this = self.clone();
        self.uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                Box::pin(async move {
                    let mut transaction = this.transactions.find_by_id(tx, transaction_id).await?;
                    transaction.cancel()?;
                    this.save_transaction(tx, &mut transaction).await?;
                    Ok(transaction)
                })
            })
            .await
    }

    /// Return up to `limit` retryable FAILED transactions to PENDING, all in one boundary.
    #[tracing::instrument(skip(self))]
    pub async fn retry_failed(&self, limit: u64) -> Result<Vec<Transaction>, LedgerError> {
        let this = self.clone();
        let retried = self
            .uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                Box::pin(async move {
                    let candidates = this
                        .transactions
                        .find_failed_retryable(tx, this.max_retries, limit)
                        .await?;
                    let mut retried = Vec::with_capacity(candidates.len());
                    for mut transaction in candidates {
                        transaction.retry(this.max_retries)?;
                        this.save_transaction(tx, &mut transaction).await?;
                        retried.push(transaction);
                    }
                    Ok(retried)
                })
            })
            .await?;
        if !retried.is_empty() {
            tracing::info!(count = retried.len(), "failed transactions requeued");
        }
        Ok(retried)
    }

    async fn record_failure(
        &self,
        transaction_id: Uuid,
        reason: &'static str,
    ) -> Result<Transaction, LedgerError> {
        let this = self.clone();
        self.uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                Box::pin(async move {
                    let mut transaction = this.transactions.find_by_id(tx, transaction_id).await?;
                    if transaction.status() == TransactionStatus::Pending {
                        transaction.start_processing()?;
                    }
                    transaction.mark_failed(reason)?;
                    this.save_transaction(tx, &mut transaction).await?;
                    Ok(transaction)
                })
            })
            .await
    }

    async fn load_payout(
        &self,
        tx: &mut Tx<TStore::Conn>,
        transaction_id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        let transaction = self.transactions.find_by_id(tx, transaction_id).await?;
        if transaction.transaction_type() != TransactionType::Payout {
            return Err(LedgerError::validation(
                "transaction_type",
                format!("{} is not a PAYOUT", transaction.id()),
            ));
        }
        Ok(transaction)
    }

    async fn move_funds(
        &self,
        tx: &mut Tx<TStore::Conn>,
        wallet_id: Uuid,
        change: impl FnOnce(&mut Wallet) -> Result<(), LedgerError> + Send,
    ) -> Result<(), LedgerError> {
        let mut wallet = self.wallets.find_by_id(tx, wallet_id).await?;
        change(&mut wallet)?;
        self.wallets.save(tx, &mut wallet).await?;
        enqueue_events(&*self.outbox, tx, wallet.take_events()).await
    }

    async fn save_transaction(
        &self,
        tx: &mut Tx<TStore::Conn>,
        transaction: &mut Transaction,
    ) -> Result<(), LedgerError> {
        self.transactions.save(tx, transaction).await?;
        enqueue_events(&*self.outbox, tx, transaction.take_events()).await
    }
}
