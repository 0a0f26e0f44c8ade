use crate::modules::wallets::core::ports::{WalletFilter, WalletRepository};
use crate::modules::wallets::core::wallet::Wallet;
use crate::shared::core::errors::LedgerError;
use crate::shared::core::primitives::Currency;
use crate::shared::core::unit_of_work::Tx;
use crate::shared::infrastructure::in_memory::{MemoryConn, RowKey};
use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryWalletRepository;

impl InMemoryWalletRepository {
    pub fn new() -> Self {
        Self
    }

    fn visible(tx: &mut Tx<MemoryConn>) -> Result<Vec<Wallet>, LedgerError> {
        tx.conn()
            .with_tables(|tables, staged, _| staged.visible_wallets(tables))
            .into_iter()
            .map(Wallet::restore)
            .collect()
    }
}

#[async_trait]
impl WalletRepository<MemoryConn> for InMemoryWalletRepository {
    async fn save(&self, tx: &mut Tx<MemoryConn>, wallet: &mut Wallet) -> Result<(), LedgerError> {
        let snapshot = wallet.snapshot();
        let expected = wallet.persisted_version();
        tx.conn().with_tables(|tables, staged, session| {
            let id = snapshot.id;
            match expected {
                None => {
                    if staged.wallet(tables, id).is_some() {
                        return Err(LedgerError::duplicate("wallet", id));
                    }
                    let owner_key =
                        RowKey::WalletOwner(snapshot.owner_id, snapshot.currency.clone());
                    let taken = staged.visible_wallets(tables).iter().any(|w| {
                        w.owner_id == snapshot.owner_id && w.currency == snapshot.currency
                    });
                    if taken || !tables.claim(owner_key, session) {
                        return Err(LedgerError::duplicate(
                            "wallet",
                            format!("{}/{}", snapshot.owner_id, snapshot.currency),
                        ));
                    }
                    tables.claim(RowKey::Wallet(id), session);
                }
                Some(expected) => {
                    if !tables.claim(RowKey::Wallet(id), session) {
                        return Err(LedgerError::concurrency("wallet", id, expected));
                    }
                    let current = staged
                        .wallet(tables, id)
                        .ok_or_else(|| LedgerError::not_found("wallet", id))?;
                    if current.version != expected {
                        return Err(LedgerError::concurrency("wallet", id, expected));
                    }
                }
            }
            staged.wallets.insert(id, snapshot);
            Ok(())
        })?;
        wallet.mark_persisted();
        Ok(())
    }

    async fn find_by_id(&self, tx: &mut Tx<MemoryConn>, id: Uuid) -> Result<Wallet, LedgerError> {
        let snapshot = tx
            .conn()
            .with_tables(|tables, staged, _| staged.wallet(tables, id).cloned());
        snapshot
            .ok_or_else(|| LedgerError::not_found("wallet", id))
            .and_then(Wallet::restore)
    }

    async fn find_by_owner_and_currency(
        &self,
        tx: &mut Tx<MemoryConn>,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<Wallet, LedgerError> {
        Self::visible(tx)?
            .into_iter()
            .find(|w| w.owner_id() == owner_id && w.currency() == currency)
            .ok_or_else(|| LedgerError::not_found("wallet", format!("{owner_id}/{currency}")))
    }

    async fn find_by_owner_id(
        &self,
        tx: &mut Tx<MemoryConn>,
        owner_id: Uuid,
    ) -> Result<Vec<Wallet>, LedgerError> {
        Ok(Self::visible(tx)?
            .into_iter()
            .filter(|w| w.owner_id() == owner_id)
            .collect())
    }

    async fn exists_by_owner_and_currency(
        &self,
        tx: &mut Tx<MemoryConn>,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<bool, LedgerError> {
        Ok(tx.conn().with_tables(|tables, staged, _| {
            staged
                .visible_wallets(tables)
                .iter()
                .any(|w| w.owner_id == owner_id && &w.currency == currency)
        }))
    }

    async fn list(
        &self,
        tx: &mut Tx<MemoryConn>,
        filter: &WalletFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Wallet>, LedgerError> {
        Ok(Self::visible(tx)?
            .into_iter()
            .filter(|w| filter.matches(w))
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[cfg(test)]
mod in_memory_wallet_repository_tests {
    use super::*;
    use crate::modules::wallets::core::wallet::WalletStatus;
    use crate::shared::core::unit_of_work::{IsolationLevel, TransactionalStore};
    use crate::shared::infrastructure::in_memory::InMemoryStore;
    use crate::test_support::fixtures::wallets::{WalletBuilder, usd, usd_amount};
    use rstest::{fixture, rstest};

    #[fixture]
    fn store() -> InMemoryStore {
        InMemoryStore::new()
    }

    async fn begin(store: &InMemoryStore) -> Tx<MemoryConn> {
        Tx::new(
            store.begin(IsolationLevel::default()).await.unwrap(),
            IsolationLevel::default(),
        )
    }

    async fn commit(store: &InMemoryStore, tx: Tx<MemoryConn>) {
        store.commit(tx.into_conn()).await.unwrap();
    }

    async fn persisted(store: &InMemoryStore, repo: &InMemoryWalletRepository) -> Wallet {
        let mut wallet = WalletBuilder::new().build();
        let mut tx = begin(store).await;
        repo.save(&mut tx, &mut wallet).await.unwrap();
        commit(store, tx).await;
        wallet
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_insert_and_read_back_a_wallet(store: InMemoryStore) {
        let repo = InMemoryWalletRepository::new();
        let wallet = persisted(&store, &repo).await;
        assert_eq!(wallet.persisted_version(), Some(0));

        let mut tx = begin(&store).await;
        let found = repo.find_by_id(&mut tx, wallet.id()).await.unwrap();
        assert_eq!(found.snapshot(), wallet.snapshot());
        let by_owner = repo
            .find_by_owner_and_currency(&mut tx, wallet.owner_id(), &usd())
            .await
            .unwrap();
        assert_eq!(by_owner.id(), wallet.id());
        assert!(
            repo.exists_by_owner_and_currency(&mut tx, wallet.owner_id(), &usd())
                .await
                .unwrap()
        );
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_reject_a_stale_save(store: InMemoryStore) {
        let repo = InMemoryWalletRepository::new();
        let wallet = persisted(&store, &repo).await;

        let mut tx = begin(&store).await;
        let mut first = repo.find_by_id(&mut tx, wallet.id()).await.unwrap();
        let mut stale = first.clone();
        first.credit(&usd_amount(10)).unwrap();
        repo.save(&mut tx, &mut first).await.unwrap();
        commit(&store, tx).await;

        stale.credit(&usd_amount(99)).unwrap();
        let mut tx = begin(&store).await;
        let err = repo.save(&mut tx, &mut stale).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert_eq!(store.wallet_snapshot(wallet.id()).unwrap().available.amount(), 10);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_fail_fast_on_a_row_held_by_another_boundary(store: InMemoryStore) {
        let repo = InMemoryWalletRepository::new();
        let wallet = persisted(&store, &repo).await;

        let mut holder = begin(&store).await;
        let mut held = repo.find_by_id(&mut holder, wallet.id()).await.unwrap();
        held.suspend().unwrap();
        repo.save(&mut holder, &mut held).await.unwrap();

        let mut other = begin(&store).await;
        let mut contender = repo.find_by_id(&mut other, wallet.id()).await.unwrap();
        assert_eq!(contender.status(), WalletStatus::Active);
        contender.credit(&usd_amount(1)).unwrap();
        let err = repo.save(&mut other, &mut contender).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_reject_a_second_wallet_for_the_same_owner_and_currency(
        store: InMemoryStore,
    ) {
        let repo = InMemoryWalletRepository::new();
        let wallet = persisted(&store, &repo).await;
        let mut twin = WalletBuilder::new().owner_id(wallet.owner_id()).build();
        let mut tx = begin(&store).await;
        let err = repo.save(&mut tx, &mut twin).await.unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate { entity: "wallet", .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_report_missing_rows_and_empty_collections(store: InMemoryStore) {
        let repo = InMemoryWalletRepository::new();
        let mut tx = begin(&store).await;
        let err = repo.find_by_id(&mut tx, Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "wallet", .. }));
        assert!(
            repo.find_by_owner_id(&mut tx, Uuid::now_v7())
                .await
                .unwrap()
                .is_empty()
        );
        let filter = WalletFilter {
            status: Some(WalletStatus::Closed),
            ..WalletFilter::default()
        };
        assert!(repo.list(&mut tx, &filter, 0, 10).await.unwrap().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_page_through_a_filtered_listing(store: InMemoryStore) {
        let repo = InMemoryWalletRepository::new();
        for _ in 0..3 {
            persisted(&store, &repo).await;
        }
        let mut tx = begin(&store).await;
        let all = repo
            .list(&mut tx, &WalletFilter::default(), 0, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let page = repo
            .list(&mut tx, &WalletFilter::default(), 1, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id(), all[1].id());
    }
}
