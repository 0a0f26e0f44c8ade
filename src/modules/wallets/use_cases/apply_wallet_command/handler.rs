use crate::modules::wallets::core::ports::WalletRepository;
use crate::modules::wallets::core::wallet::Wallet;
use crate::modules::wallets::use_cases::apply_wallet_command::command::WalletCommand;
use crate::shared::application::unit_of_work::UnitOfWork;
use crate::shared::core::errors::LedgerError;
use crate::shared::core::unit_of_work::{TransactionalStore, Tx};
use crate::shared::infrastructure::outbox::{OutboxWriter, enqueue_events};
use std::sync::Arc;
use uuid::Uuid;

pub struct WalletCommandHandler<TStore, TWallets, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    uow: UnitOfWork<TStore>,
    wallets: Arc<TWallets>,
    outbox: Arc<TOutbox>,
    conflict_retries: u32,
}

impl<TStore, TWallets, TOutbox> Clone for WalletCommandHandler<TStore, TWallets, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            uow: self.uow.clone(),
            wallets: Arc::clone(&self.wallets),
            outbox: Arc::clone(&self.outbox),
            conflict_retries: self.conflict_retries,
        }
    }
}

impl<TStore, TWallets, TOutbox> WalletCommandHandler<TStore, TWallets, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    pub fn new(
        uow: UnitOfWork<TStore>,
        wallets: Arc<TWallets>,
        outbox: Arc<TOutbox>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            uow,
            wallets,
            outbox,
            conflict_retries,
        }
    }

    /// Apply `command` in its own boundary. A lost optimistic race reloads the wallet and tries again,
    /// at most `conflict_retries` more times.
    #[tracing::instrument(skip(self, command), fields(op = command.name()))]
    pub async fn handle(&self, wallet_id: Uuid, command: WalletCommand) -> Result<Wallet, LedgerError> {
        let mut conflicts = 0;
        loop {
            let this = self.clone();
            let attempt = command.clone();
            let result = self
                .uow
                .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                    let this = this.clone();
                    let command = attempt.clone();
                    Box::pin(async move { this.handle_in(tx, wallet_id, &command).await })
                })
                .await;
            match result {
                Err(err) if err.is_concurrency_conflict() && conflicts < self.conflict_retries => {
                    conflicts += 1;
                    tracing::debug!(conflicts, error = %err, "stale wallet, reloading");
                }
                other => return other,
            }
        }
    }

    /// Load, mutate, save and enqueue inside a boundary the caller already holds. Conflicts are returned
    /// to the caller, who owns the boundary and therefore the retry decision.
    pub async fn handle_in(
        &self,
        tx: &mut Tx<TStore::Conn>,
        wallet_id: Uuid,
        command: &WalletCommand,
    ) -> Result<Wallet, LedgerError> {
        let mut wallet = self.wallets.find_by_id(tx, wallet_id).await?;
        command.apply_to(&mut wallet)?;
        self.wallets.save(tx, &mut wallet).await?;
        enqueue_events(&*self.outbox, tx, wallet.take_events()).await?;
        Ok(wallet)
    }
}
