// Ports the wallet module needs from persistence.
//
// Responsibilities
// - `save` inserts a never-persisted wallet or updates an existing one with a compare-and-swap on the
//   version the wallet was loaded at. A stale version is a `Concurrency` error, never a silent merge.
// - Single-row lookups fail with `NotFound`; collection lookups return empty vectors.
//
// Boundaries
// - Every call takes the transaction-scoped handle of the unit of work it belongs to.

use crate::modules::wallets::core::wallet::{Wallet, WalletStatus, WalletType};
use crate::shared::core::errors::LedgerError;
use crate::shared::core::primitives::Currency;
use crate::shared::core::unit_of_work::Tx;
use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletFilter {
    pub owner_id: Option<Uuid>,
    pub currency: Option<Currency>,
    pub status: Option<WalletStatus>,
    pub wallet_type: Option<WalletType>,
}

impl WalletFilter {
    pub fn matches(&self, wallet: &Wallet) -> bool {
        self.owner_id.is_none_or(|owner| wallet.owner_id() == owner)
            && self
                .currency
                .as_ref()
                .is_none_or(|currency| wallet.currency() == currency)
            && self.status.is_none_or(|status| wallet.status() == status)
            && self
                .wallet_type
                .is_none_or(|wallet_type| wallet.wallet_type() == wallet_type)
    }
}

#[async_trait]
pub trait WalletRepository<C: Send>: Send + Sync {
    async fn save(&self, tx: &mut Tx<C>, wallet: &mut Wallet) -> Result<(), LedgerError>;

    async fn find_by_id(&self, tx: &mut Tx<C>, id: Uuid) -> Result<Wallet, LedgerError>;

    async fn find_by_owner_and_currency(
        &self,
        tx: &mut Tx<C>,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<Wallet, LedgerError>;

    async fn find_by_owner_id(&self, tx: &mut Tx<C>, owner_id: Uuid)
    -> Result<Vec<Wallet>, LedgerError>;

    async fn exists_by_owner_and_currency(
        &self,
        tx: &mut Tx<C>,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<bool, LedgerError>;

    async fn list(
        &self,
        tx: &mut Tx<C>,
        filter: &WalletFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Wallet>, LedgerError>;
}
