// Idempotent recording of a transaction request.
//
// Responsibilities
// - Read before write: a known idempotency key returns the stored transaction, whatever the new request
//   says. Only an unknown key creates a row.
// - A duplicate-key failure on insert means another request with the same key won the race. It is
//   resolved by reading the winner's row in a fresh boundary, never surfaced when that row exists.
// - The wallet (and the destination of a TRANSFER) must exist and hold the transaction's currency.

use crate::modules::transactions::core::ports::TransactionRepository;
use crate::modules::transactions::core::transaction::{Transaction, TransactionType};
use crate::modules::transactions::use_cases::record_transaction::command::{
    RecordOutcome, RecordTransaction,
};
use crate::modules::wallets::core::ports::WalletRepository;
use crate::shared::application::unit_of_work::UnitOfWork;
use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::{TransactionalStore, Tx};
use crate::shared::infrastructure::outbox::{OutboxWriter, enqueue_events};
use std::sync::Arc;

pub struct RecordTransactionHandler<TStore, TWallets, TTransactions, TOutbox>
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
}

impl<TStore, TWallets, TTransactions, TOutbox> Clone
    for RecordTransactionHandler<TStore, TWallets, TTransactions, TOutbox>
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
        }
    }
}

impl<TStore, TWallets, TTransactions, TOutbox>
    RecordTransactionHandler<TStore, TWallets, TTransactions, TOutbox>
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
    ) -> Self {
        Self {
            uow,
            wallets,
            transactions,
            outbox,
        }
    }

    #[tracing::instrument(skip(self, command), fields(wallet_id = %command.wallet_id, key = %command.idempotency_key))]
    pub async fn handle(&self, command: RecordTransaction) -> Result<RecordOutcome, LedgerError> {
        let this = self.clone();
        let request = command.clone();
        let result = self
            .uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                let command = request.clone();
                Box::pin(async move { this.handle_in(tx, &command).await })
            })
            .await;
        match result {
            Ok(outcome) => {
                if outcome.created {
                    tracing::info!(transaction_id = %outcome.transaction.id(), "transaction recorded");
                }
                Ok(outcome)
            }
            Err(err @ LedgerError::Duplicate { entity: "transaction", .. }) => {
                tracing::debug!(error = %err, "lost idempotency race, reading the winner");
                match self.find_committed(command.idempotency_key.trim()).await? {
                    Some(transaction) => Ok(RecordOutcome {
                        transaction,
                        created: false,
                    }),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Record inside a boundary the caller already holds.
    pub async fn handle_in(
        &self,
        tx: &mut Tx<TStore::Conn>,
        command: &RecordTransaction,
    ) -> Result<RecordOutcome, LedgerError> {
        let key = command.idempotency_key.trim();
        if let Some(existing) = self.transactions.find_by_idempotency_key(tx, key).await? {
            return Ok(RecordOutcome {
                transaction: existing,
                created: false,
            });
        }

        let wallet = self.wallets.find_by_id(tx, command.wallet_id).await?;
        command.amount.ensure_currency(wallet.currency())?;
        let mut transaction = Transaction::create(command.to_new_transaction())?;

        match (command.transaction_type, command.destination_wallet_id) {
            (TransactionType::Transfer, Some(destination_id)) => {
                let destination = self.wallets.find_by_id(tx, destination_id).await?;
                command.amount.ensure_currency(destination.currency())?;
                transaction.set_destination_wallet(destination_id)?;
            }
            (TransactionType::Transfer, None) => {
                return Err(LedgerError::validation(
                    "destination_wallet_id",
                    "a TRANSFER needs a destination wallet",
                ));
            }
            (_, Some(_)) => {
                return Err(LedgerError::validation(
                    "destination_wallet_id",
                    format!("{} does not take a destination wallet", command.transaction_type),
                ));
            }
            (_, None) => {}
        }

        self.transactions.save(tx, &mut transaction).await?;
        enqueue_events(&*self.outbox, tx, transaction.take_events()).await?;
        Ok(RecordOutcome {
            transaction,
            created: true,
        })
    }

    /// The winner of an idempotency race may still be committing; look a few times before giving up.
    async fn find_committed(&self, key: &str) -> Result<Option<Transaction>, LedgerError> {
        let attempts = self.uow.config().retry_max_attempts.max(1);
        for attempt in 1..=attempts {
            let transactions = Arc::clone(&self.transactions);
            let lookup = key.to_string();
            let found = self
                .uow
                .execute_with_result(move |tx| {
                    Box::pin(async move { transactions.find_by_idempotency_key(tx, &lookup).await })
                })
                .await?;
            if found.is_some() || attempt == attempts {
                return Ok(found);
            }
            tokio::time::sleep(self.uow.config().backoff(attempt)).await;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod record_transaction_handler_tests {
    use super::*;
    use crate::modules::transactions::adapters::outbound::in_memory_transaction_repository::InMemoryTransactionRepository;
    use crate::modules::transactions::core::transaction::TransactionStatus;
    use crate::modules::wallets::adapters::outbound::in_memory_wallet_repository::InMemoryWalletRepository;
    use crate::shared::application::unit_of_work::UnitOfWorkConfig;
    use crate::shared::infrastructure::in_memory::InMemoryStore;
    use crate::shared::infrastructure::outbox::in_memory::InMemoryOutbox;
    use crate::shared::core::primitives::{Currency, Money};
    use crate::test_support::fixtures::wallets::{WalletBuilder, usd_amount};
    use rstest::{fixture, rstest};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    type Handler = RecordTransactionHandler<
        InMemoryStore,
        InMemoryWalletRepository,
        InMemoryTransactionRepository,
        InMemoryOutbox,
    >;

    struct Context {
        store: Arc<InMemoryStore>,
        handler: Handler,
        source: Uuid,
        destination: Uuid,
    }

    #[fixture]
    async fn context() -> Context {
        let store = Arc::new(InMemoryStore::new());
        let uow = UnitOfWork::new(Arc::clone(&store), UnitOfWorkConfig::default());
        let wallets = Arc::new(InMemoryWalletRepository::new());
        let repo = Arc::clone(&wallets);
        let (source, destination) = uow
            .execute_with_result(move |tx| {
                Box::pin(async move {
                    let mut source = WalletBuilder::new().build();
                    let mut destination = WalletBuilder::new().build();
                    repo.save(tx, &mut source).await?;
                    repo.save(tx, &mut destination).await?;
                    Ok((source.id(), destination.id()))
                })
            })
            .await
            .unwrap();
        let handler = RecordTransactionHandler::new(
            uow,
            wallets,
            Arc::new(InMemoryTransactionRepository::new()),
            Arc::new(InMemoryOutbox::new()),
        );
        Context {
            store,
            handler,
            source,
            destination,
        }
    }

    fn deposit(wallet_id: Uuid, key: &str) -> RecordTransaction {
        RecordTransaction {
            wallet_id,
            idempotency_key: key.to_string(),
            transaction_type: TransactionType::Deposit,
            amount: usd_amount(250),
            destination_wallet_id: None,
            description: "top up".to_string(),
            external_reference: None,
            metadata: BTreeMap::new(),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_create_once_and_replay_afterwards(#[future] context: Context) {
        let Context {
            store,
            handler,
            source,
            ..
        } = context.await;
        let first = handler.handle(deposit(source, "pay-1")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.transaction.status(), TransactionStatus::Pending);

        let mut replay = deposit(source, "pay-1");
        replay.amount = usd_amount(999);
        let second = handler.handle(replay).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.transaction.id(), first.transaction.id());
        assert_eq!(second.transaction.amount().amount(), 250);

        assert_eq!(store.transaction_count(), 1);
        let created: Vec<_> = store
            .outbox_entries()
            .into_iter()
            .filter(|e| e.event_type == "TransactionCreated")
            .collect();
        assert_eq!(created.len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_yield_one_row_for_concurrent_requests_with_one_key(
        #[future] context: Context,
    ) {
        let Context {
            store,
            handler,
            source,
            ..
        } = context.await;
        let requests = (0..8).map(|_| handler.handle(deposit(source, "burst")));
        let outcomes: Vec<_> = futures::future::join_all(requests)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
        let id = outcomes[0].transaction.id();
        assert!(outcomes.iter().all(|o| o.transaction.id() == id));
        assert_eq!(store.transaction_count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_attach_the_destination_of_a_transfer(#[future] context: Context) {
        let Context {
            handler,
            source,
            destination,
            ..
        } = context.await;
        let mut transfer = deposit(source, "move-1");
        transfer.transaction_type = TransactionType::Transfer;
        transfer.destination_wallet_id = Some(destination);
        let outcome = handler.handle(transfer).await.unwrap();
        assert_eq!(outcome.transaction.destination_wallet_id(), Some(destination));

        let mut missing = deposit(source, "move-2");
        missing.transaction_type = TransactionType::Transfer;
        assert!(matches!(
            handler.handle(missing).await.unwrap_err(),
            LedgerError::Validation { field: "destination_wallet_id", .. }
        ));

        let mut misplaced = deposit(source, "move-3");
        misplaced.destination_wallet_id = Some(destination);
        assert!(matches!(
            handler.handle(misplaced).await.unwrap_err(),
            LedgerError::Validation { field: "destination_wallet_id", .. }
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_reject_unknown_wallets_and_foreign_currencies(#[future] context: Context) {
        let Context {
            store,
            handler,
            source,
            ..
        } = context.await;
        let err = handler
            .handle(deposit(Uuid::now_v7(), "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "wallet", .. }));

        let mut foreign = deposit(source, "eur-1");
        foreign.amount = Money::new(10, Currency::new("EUR").unwrap()).unwrap();
        let err = handler.handle(foreign).await.unwrap_err();
        assert!(err.rule_code().is_some());
        assert_eq!(store.transaction_count(), 0);
        assert!(store.outbox_entries().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_match_keys_after_trimming(#[future] context: Context) {
        let Context {
            handler, source, ..
        } = context.await;
        let first = handler.handle(deposit(source, "spaced")).await.unwrap();
        let second = handler.handle(deposit(source, "  spaced ")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.transaction.id(), first.transaction.id());
    }
}
