use crate::modules::wallets::core::ports::WalletRepository;
use crate::modules::wallets::core::wallet::Wallet;
use crate::modules::wallets::use_cases::open_wallet::command::{DefaultLimits, OpenWallet};
use crate::shared::application::unit_of_work::UnitOfWork;
use crate::shared::core::errors::LedgerError;
use crate::shared::core::primitives::{Currency, Money};
use crate::shared::core::unit_of_work::{TransactionalStore, Tx};
use crate::shared::infrastructure::outbox::{OutboxWriter, enqueue_events};
use std::sync::Arc;

pub struct OpenWalletHandler<TStore, TWallets, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    uow: UnitOfWork<TStore>,
    wallets: Arc<TWallets>,
    outbox: Arc<TOutbox>,
    defaults: DefaultLimits,
}

impl<TStore, TWallets, TOutbox> Clone for OpenWalletHandler<TStore, TWallets, TOutbox>
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
            defaults: self.defaults,
        }
    }
}

impl<TStore, TWallets, TOutbox> OpenWalletHandler<TStore, TWallets, TOutbox>
where
    TStore: TransactionalStore,
    TWallets: WalletRepository<TStore::Conn> + 'static,
    TOutbox: OutboxWriter<TStore::Conn> + 'static,
{
    pub fn new(
        uow: UnitOfWork<TStore>,
        wallets: Arc<TWallets>,
        outbox: Arc<TOutbox>,
        defaults: DefaultLimits,
    ) -> Self {
        Self {
            uow,
            wallets,
            outbox,
            defaults,
        }
    }

    #[tracing::instrument(skip(self, command), fields(owner_id = %command.owner_id, currency = %command.currency))]
    pub async fn handle(&self, command: OpenWallet) -> Result<Wallet, LedgerError> {
        let this = self.clone();
        let wallet = self
            .uow
            .execute_with_retry(self.uow.config().retry_max_attempts, move |tx| {
                let this = this.clone();
                let command = command.clone();
                Box::pin(async move { this.handle_in(tx, command).await })
            })
            .await?;
        tracing::info!(wallet_id = %wallet.id(), "wallet opened");
        Ok(wallet)
    }

    /// Open the wallet inside a boundary the caller already holds.
    pub async fn handle_in(
        &self,
        tx: &mut Tx<TStore::Conn>,
        command: OpenWallet,
    ) -> Result<Wallet, LedgerError> {
        let currency = Currency::new(&command.currency)?;
        if self
            .wallets
            .exists_by_owner_and_currency(tx, command.owner_id, &currency)
            .await?
        {
            return Err(LedgerError::duplicate(
                "wallet",
                format!("{}/{}", command.owner_id, currency),
            ));
        }
        let daily = Money::new(
            command.daily_limit.unwrap_or(self.defaults.daily),
            currency.clone(),
        )?;
        let monthly = Money::new(
            command.monthly_limit.unwrap_or(self.defaults.monthly),
            currency.clone(),
        )?;
        let mut wallet = Wallet::open(
            command.owner_id,
            currency,
            command.wallet_type,
            daily,
            monthly,
        )?;
        self.wallets.save(tx, &mut wallet).await?;
        enqueue_events(&*self.outbox, tx, wallet.take_events()).await?;
        Ok(wallet)
    }
}
