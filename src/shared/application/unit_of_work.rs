// Unit of work: runs one operation inside one atomic boundary of a `TransactionalStore`.
//
// Purpose
// - Guarantee that every repository and outbox call made through the `Tx` handed to an operation commits
//   together or not at all.
//
// Responsibilities
// - Ok commits. Err rolls back and returns the operation's error unchanged. A panic rolls back and is
//   then resumed on the caller.
// - Optional deadline per boundary; on expiry the in-flight work is dropped and the boundary rolled back.
// - Bounded retry with capped exponential backoff, for transient infrastructure faults only.
//
// Boundaries
// - Knows nothing about wallets or transactions. Nesting is `Tx::nested`, not a second boundary.

use crate::shared::core::errors::{InfraKind, LedgerError};
use crate::shared::core::unit_of_work::{IsolationLevel, TransactionalStore, Tx};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWorkConfig {
    pub isolation: IsolationLevel,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub timeout: Option<Duration>,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            retry_max_attempts: 3,
            retry_base_backoff: Duration::from_millis(25),
            retry_max_backoff: Duration::from_millis(1_000),
            timeout: None,
        }
    }
}

impl UnitOfWorkConfig {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ... capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_base_backoff
            .saturating_mul(factor)
            .min(self.retry_max_backoff)
    }
}

pub struct UnitOfWork<S: TransactionalStore> {
    store: Arc<S>,
    config: UnitOfWorkConfig,
}

impl<S: TransactionalStore> Clone for UnitOfWork<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: TransactionalStore> UnitOfWork<S> {
    pub fn new(store: Arc<S>, config: UnitOfWorkConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn execute<F>(&self, op: F) -> Result<(), LedgerError>
    where
        F: for<'t> FnOnce(&'t mut Tx<S::Conn>) -> BoxFuture<'t, Result<(), LedgerError>> + Send,
    {
        self.run(self.config.isolation, op).await
    }

    pub async fn execute_with_result<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx<S::Conn>) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        self.run(self.config.isolation, op).await
    }

    pub async fn execute_with_isolation<T, F>(
        &self,
        isolation: IsolationLevel,
        op: F,
    ) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx<S::Conn>) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        self.run(isolation, op).await
    }

    /// Re-run `op` in a fresh boundary while it fails with a retryable infrastructure fault, up to
    /// `max_attempts` runs in total. Any other error is returned from the attempt that produced it.
    pub async fn execute_with_retry<T, F>(&self, max_attempts: u32, op: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Tx<S::Conn>) -> BoxFuture<'t, Result<T, LedgerError>> + Send + Sync,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run(self.config.isolation, &op).await {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying unit of work"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(attempt, error = %err, "unit of work retries exhausted");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    async fn run<T, F>(&self, isolation: IsolationLevel, op: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx<S::Conn>) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        let conn = self.store.begin(isolation).await?;
        let mut tx = Tx::new(conn, isolation);
        let boundary = tx.id();
        tracing::debug!(%boundary, %isolation, "unit of work started");

        let work = AssertUnwindSafe(op(&mut tx)).catch_unwind();
        let outcome = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                // The elapsed future was dropped with the timer, releasing its borrow of `tx`.
                Err(_) => {
                    self.rollback(tx, "deadline exceeded").await;
                    return Err(LedgerError::infrastructure(
                        InfraKind::Timeout,
                        format!("unit of work {boundary} exceeded {}ms", limit.as_millis()),
                    ));
                }
            },
            None => work.await,
        };

        match outcome {
            Ok(Ok(value)) => {
                self.store.commit(tx.into_conn()).await?;
                tracing::debug!(%boundary, "unit of work committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback(tx, "operation failed").await;
                Err(err)
            }
            Err(panic) => {
                self.rollback(tx, "operation panicked").await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// A failing rollback is logged, never allowed to mask the error that caused it.
    async fn rollback(&self, tx: Tx<S::Conn>, cause: &'static str) {
        let boundary = tx.id();
        match self.store.rollback(tx.into_conn()).await {
            Ok(()) => tracing::debug!(%boundary, cause, "unit of work rolled back"),
            Err(err) => tracing::warn!(%boundary, cause, error = %err, "rollback failed"),
        }
    }
}

#[cfg(test)]
mod unit_of_work_tests {
    use super::*;
    use crate::modules::wallets::adapters::outbound::in_memory_wallet_repository::InMemoryWalletRepository;
    use crate::modules::wallets::core::ports::WalletRepository;
    use crate::shared::core::errors::RuleCode;
    use crate::shared::infrastructure::in_memory::InMemoryStore;
    use crate::shared::infrastructure::outbox::enqueue_events;
    use crate::shared::infrastructure::outbox::in_memory::InMemoryOutbox;
    use crate::test_support::fixtures::wallets::{WalletBuilder, usd_amount};
    use rstest::{fixture, rstest};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[fixture]
    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new())
    }

    fn fast() -> UnitOfWorkConfig {
        UnitOfWorkConfig {
            retry_base_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(2),
            ..UnitOfWorkConfig::default()
        }
    }

    #[rstest]
    fn it_should_back_off_exponentially_up_to_the_cap() {
        let config = UnitOfWorkConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(25));
        assert_eq!(config.backoff(2), Duration::from_millis(50));
        assert_eq!(config.backoff(3), Duration::from_millis(100));
        assert_eq!(config.backoff(30), Duration::from_millis(1_000));
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_commit_when_the_operation_succeeds(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let repo = InMemoryWalletRepository::new();
        let id = uow
            .execute_with_result(move |tx| {
                Box::pin(async move {
                    let mut wallet = WalletBuilder::new().build();
                    repo.save(tx, &mut wallet).await?;
                    Ok(wallet.id())
                })
            })
            .await
            .unwrap();
        assert!(store.wallet_snapshot(id).is_some());
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_roll_back_and_return_the_original_error(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let repo = InMemoryWalletRepository::new();
        let err = uow
            .execute(move |tx| {
                Box::pin(async move {
                    let mut wallet = WalletBuilder::new().build();
                    repo.save(tx, &mut wallet).await?;
                    wallet.debit(&usd_amount(1))?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.rule_code(), Some(RuleCode::InsufficientBalance));
        assert_eq!(store.wallet_count(), 0);
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_discard_a_credit_and_its_events_when_a_later_step_fails(
        store: Arc<InMemoryStore>,
    ) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let id = uow
            .execute_with_result(move |tx| {
                Box::pin(async move {
                    let mut wallet = WalletBuilder::new().build();
                    InMemoryWalletRepository::new().save(tx, &mut wallet).await?;
                    enqueue_events(&InMemoryOutbox::new(), tx, wallet.take_events()).await?;
                    Ok(wallet.id())
                })
            })
            .await
            .unwrap();
        let before = store.wallet_snapshot(id).unwrap();
        let entries_before = store.outbox_entries().len();

        let err = uow
            .execute(move |tx| {
                Box::pin(async move {
                    let repo = InMemoryWalletRepository::new();
                    let mut wallet = repo.find_by_id(tx, id).await?;
                    wallet.credit(&usd_amount(100))?;
                    repo.save(tx, &mut wallet).await?;
                    enqueue_events(&InMemoryOutbox::new(), tx, wallet.take_events()).await?;
                    wallet.debit(&usd_amount(1_000))?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.rule_code(), Some(RuleCode::InsufficientBalance));
        let after = store.wallet_snapshot(id).unwrap();
        assert_eq!(after.available, before.available);
        assert_eq!(after.version, before.version);
        assert_eq!(store.outbox_entries().len(), entries_before);
        assert!(
            store
                .outbox_entries()
                .iter()
                .all(|e| e.event_type != "WalletCredited")
        );
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_roll_back_and_resume_a_panic(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let repo = InMemoryWalletRepository::new();
        let joined = tokio::spawn(async move {
            uow.execute(move |tx| {
                Box::pin(async move {
                    let mut wallet = WalletBuilder::new().build();
                    repo.save(tx, &mut wallet).await?;
                    panic!("ledger invariant broken");
                })
            })
            .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(store.wallet_count(), 0);
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_let_nested_work_join_the_outer_boundary(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let repo = InMemoryWalletRepository::new();
        let err = uow
            .execute(move |tx| {
                Box::pin(async move {
                    let depth = tx
                        .nested(move |inner| {
                            Box::pin(async move {
                                let mut wallet = WalletBuilder::new().build();
                                repo.save(inner, &mut wallet).await?;
                                Ok(inner.depth())
                            })
                        })
                        .await?;
                    assert_eq!(depth, 1);
                    assert_eq!(tx.depth(), 0);
                    Err(LedgerError::validation("amount", "outer boundary rejects"))
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation { field: "amount", .. }));
        assert_eq!(store.wallet_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_retry_transient_commit_failures(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let repo = InMemoryWalletRepository::new();
        let attempts = Arc::new(AtomicU32::new(0));
        store.fail_next_commits(2, InfraKind::SerializationFailure);

        let counter = Arc::clone(&attempts);
        uow.execute_with_retry(3, move |tx| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut wallet = WalletBuilder::new().build();
                repo.save(tx, &mut wallet).await
            })
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.wallet_count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_give_up_after_the_last_attempt(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let attempts = Arc::new(AtomicU32::new(0));
        store.fail_next_commits(5, InfraKind::Deadlock);

        let counter = Arc::clone(&attempts);
        let err = uow
            .execute_with_retry(3, move |_tx| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_not_retry_domain_failures(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let err = uow
            .execute_with_retry(5, move |_tx| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LedgerError::concurrency("wallet", "w-1", 2))
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_roll_back_when_the_deadline_passes(store: Arc<InMemoryStore>) {
        let config = UnitOfWorkConfig {
            timeout: Some(Duration::from_millis(20)),
            ..fast()
        };
        let uow = UnitOfWork::new(Arc::clone(&store), config);
        let repo = InMemoryWalletRepository::new();
        let err = uow
            .execute(move |tx| {
                Box::pin(async move {
                    let mut wallet = WalletBuilder::new().build();
                    repo.save(tx, &mut wallet).await?;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Infrastructure { kind: InfraKind::Timeout, .. }
        ));
        assert!(!err.is_retryable());
        assert_eq!(store.wallet_count(), 0);
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_run_with_the_requested_isolation(store: Arc<InMemoryStore>) {
        let uow = UnitOfWork::new(Arc::clone(&store), fast());
        let level = uow
            .execute_with_isolation(IsolationLevel::Serializable, |tx| {
                Box::pin(async move { Ok(tx.conn().isolation()) })
            })
            .await
            .unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }
}
