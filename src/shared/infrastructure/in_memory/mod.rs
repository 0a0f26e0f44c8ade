// In-memory `TransactionalStore` used by tests and local wiring.
//
// Purpose
// - Behave like a read-committed relational store closely enough that unit-of-work, idempotency, and
//   outbox semantics can be exercised without a database.
//
// Responsibilities
// - Each boundary stages its writes in its own `MemoryConn`; commit applies them atomically, rollback or
//   drop discards them.
// - Rows written or dequeued by a boundary are claimed by it until it ends. Another boundary touching a
//   claimed row fails fast (writes) or skips it (dequeue), like `FOR UPDATE NOWAIT` / `SKIP LOCKED`.
// - Fault injection (offline store, failing commits) for retry and rollback tests.
//
// Boundaries
// - Isolation levels are recorded but only read-committed visibility is emulated.
// - The table mutex is a plain `std::sync::Mutex`: it is never held across an await, and `Drop` has to
//   release claims synchronously.

use crate::modules::transactions::core::transaction::TransactionSnapshot;
use crate::modules::wallets::core::wallet::WalletSnapshot;
use crate::shared::core::errors::{InfraKind, LedgerError};
use crate::shared::core::primitives::Currency;
use crate::shared::core::unit_of_work::{IsolationLevel, TransactionalStore};
use crate::shared::infrastructure::outbox::OutboxEntry;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub(crate) type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RowKey {
    Wallet(Uuid),
    WalletOwner(Uuid, Currency),
    Transaction(Uuid),
    IdempotencyKey(String),
    Outbox(Uuid),
}

/// Committed state, shared by every boundary of one store.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub wallets: HashMap<Uuid, WalletSnapshot>,
    pub transactions: HashMap<Uuid, TransactionSnapshot>,
    pub idempotency_keys: HashMap<String, Uuid>,
    /// Kept sorted by `created_at`, insertion order on ties.
    pub outbox: Vec<OutboxEntry>,
    claims: HashMap<RowKey, SessionId>,
    next_session: SessionId,
}

impl Tables {
    /// Returns false when another open boundary already holds the row.
    pub fn claim(&mut self, key: RowKey, session: SessionId) -> bool {
        match self.claims.get(&key) {
            Some(owner) if *owner != session => false,
            _ => {
                self.claims.insert(key, session);
                true
            }
        }
    }

    pub fn claimed_by_other(&self, key: &RowKey, session: SessionId) -> bool {
        self.claims.get(key).is_some_and(|owner| *owner != session)
    }

    fn release(&mut self, session: SessionId) {
        self.claims.retain(|_, owner| *owner != session);
    }
}

/// Writes of one open boundary, invisible to every other boundary until commit.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    pub wallets: HashMap<Uuid, WalletSnapshot>,
    pub transactions: HashMap<Uuid, TransactionSnapshot>,
    pub outbox_inserts: Vec<OutboxEntry>,
    pub outbox_updates: HashMap<Uuid, OutboxEntry>,
    pub outbox_deletes: HashSet<Uuid>,
}

impl Staged {
    pub fn wallet<'a>(&'a self, tables: &'a Tables, id: Uuid) -> Option<&'a WalletSnapshot> {
        self.wallets.get(&id).or_else(|| tables.wallets.get(&id))
    }

    pub fn transaction<'a>(
        &'a self,
        tables: &'a Tables,
        id: Uuid,
    ) -> Option<&'a TransactionSnapshot> {
        self.transactions
            .get(&id)
            .or_else(|| tables.transactions.get(&id))
    }

    /// Committed wallets overlaid with this boundary's own writes.
    pub fn visible_wallets(&self, tables: &Tables) -> Vec<WalletSnapshot> {
        let mut rows: HashMap<Uuid, WalletSnapshot> = tables.wallets.clone();
        rows.extend(self.wallets.iter().map(|(id, w)| (*id, w.clone())));
        let mut rows: Vec<_> = rows.into_values().collect();
        rows.sort_by_key(|w| (w.created_at, w.id));
        rows
    }

    pub fn visible_transactions(&self, tables: &Tables) -> Vec<TransactionSnapshot> {
        let mut rows: HashMap<Uuid, TransactionSnapshot> = tables.transactions.clone();
        rows.extend(self.transactions.iter().map(|(id, t)| (*id, t.clone())));
        let mut rows: Vec<_> = rows.into_values().collect();
        rows.sort_by_key(|t| (t.created_at, t.id));
        rows
    }

    /// Outbox rows as this boundary sees them, oldest first.
    pub fn visible_outbox(&self, tables: &Tables) -> Vec<OutboxEntry> {
        let mut rows: Vec<OutboxEntry> = tables
            .outbox
            .iter()
            .filter(|e| !self.outbox_deletes.contains(&e.id))
            .map(|e| self.outbox_updates.get(&e.id).unwrap_or(e).clone())
            .chain(self.outbox_inserts.iter().cloned())
            .collect();
        rows.sort_by_key(|e| e.created_at);
        rows
    }

    /// Stage a modified outbox row, whether it was committed earlier or inserted by this boundary.
    pub fn put_outbox(&mut self, entry: OutboxEntry) {
        if let Some(own) = self.outbox_inserts.iter_mut().find(|e| e.id == entry.id) {
            *own = entry;
        } else {
            self.outbox_updates.insert(entry.id, entry);
        }
    }

    fn apply(self, tables: &mut Tables) {
        tables.wallets.extend(self.wallets);
        for (id, transaction) in self.transactions {
            tables
                .idempotency_keys
                .insert(transaction.idempotency_key.clone(), id);
            tables.transactions.insert(id, transaction);
        }
        if !self.outbox_deletes.is_empty() {
            tables.outbox.retain(|e| !self.outbox_deletes.contains(&e.id));
        }
        for row in tables.outbox.iter_mut() {
            if let Some(updated) = self.outbox_updates.get(&row.id) {
                *row = updated.clone();
            }
        }
        if !self.outbox_inserts.is_empty() {
            tables.outbox.extend(self.outbox_inserts);
            tables.outbox.sort_by_key(|e| e.created_at);
        }
    }
}

/// Connection of one open boundary. Dropping it without a commit discards its writes.
#[derive(Debug)]
pub struct MemoryConn {
    session: SessionId,
    isolation: IsolationLevel,
    tables: Arc<Mutex<Tables>>,
    staged: Staged,
    finished: bool,
}

impl MemoryConn {
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub(crate) fn with_tables<R>(
        &mut self,
        f: impl FnOnce(&mut Tables, &mut Staged, SessionId) -> R,
    ) -> R {
        let mut tables = lock(&self.tables);
        f(&mut tables, &mut self.staged, self.session)
    }

    fn apply(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        let mut tables = lock(&self.tables);
        staged.apply(&mut tables);
        tables.release(self.session);
        self.finished = true;
    }

    fn discard(&mut self) {
        self.staged = Staged::default();
        lock(&self.tables).release(self.session);
        self.finished = true;
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(session = self.session, "in-memory boundary dropped, discarding");
            self.discard();
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: AtomicBool,
    failing_commits: Mutex<VecDeque<InfraKind>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip between online and offline. While offline, `begin` and `commit` fail with a connection fault.
    pub fn toggle_offline(&self) {
        self.faults.offline.fetch_xor(true, Ordering::SeqCst);
    }

    /// Make the next `count` commits fail with `kind`, discarding the boundary's writes.
    pub fn fail_next_commits(&self, count: usize, kind: InfraKind) {
        let mut queue = self
            .faults
            .failing_commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.extend(std::iter::repeat_n(kind, count));
    }

    pub fn wallet_snapshot(&self, id: Uuid) -> Option<WalletSnapshot> {
        lock(&self.tables).wallets.get(&id).cloned()
    }

    pub fn transaction_snapshot(&self, id: Uuid) -> Option<TransactionSnapshot> {
        lock(&self.tables).transactions.get(&id).cloned()
    }

    pub fn wallet_count(&self) -> usize {
        lock(&self.tables).wallets.len()
    }

    pub fn transaction_count(&self) -> usize {
        lock(&self.tables).transactions.len()
    }

    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        lock(&self.tables).outbox.clone()
    }

    /// Rows currently claimed by open boundaries.
    pub fn open_claims(&self) -> usize {
        lock(&self.tables).claims.len()
    }

    fn ensure_online(&self) -> Result<(), LedgerError> {
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::infrastructure(
                InfraKind::Connection,
                "in-memory store is offline",
            ));
        }
        Ok(())
    }

    fn next_commit_failure(&self) -> Option<InfraKind> {
        self.faults
            .failing_commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    type Conn = MemoryConn;

    async fn begin(&self, isolation: IsolationLevel) -> Result<MemoryConn, LedgerError> {
        self.ensure_online()?;
        let session = {
            let mut tables = lock(&self.tables);
            tables.next_session += 1;
            tables.next_session
        };
        Ok(MemoryConn {
            session,
            isolation,
            tables: Arc::clone(&self.tables),
            staged: Staged::default(),
            finished: false,
        })
    }

    async fn commit(&self, mut conn: MemoryConn) -> Result<(), LedgerError> {
        self.ensure_online()?;
        if let Some(kind) = self.next_commit_failure() {
            conn.discard();
            return Err(LedgerError::infrastructure(kind, "injected commit failure"));
        }
        conn.apply();
        Ok(())
    }

    async fn rollback(&self, mut conn: MemoryConn) -> Result<(), LedgerError> {
        conn.discard();
        Ok(())
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod in_memory_store_tests {
    use super::*;
    use crate::test_support::fixtures::wallets::WalletBuilder;
    use rstest::{fixture, rstest};

    #[fixture]
    fn store() -> InMemoryStore {
        InMemoryStore::new()
    }

    fn stage_wallet(conn: &mut MemoryConn) -> Uuid {
        let snapshot = WalletBuilder::new().build().snapshot();
        let id = snapshot.id;
        conn.with_tables(|tables, staged, session| {
            assert!(tables.claim(RowKey::Wallet(id), session));
            staged.wallets.insert(id, snapshot);
        });
        id
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_apply_staged_writes_on_commit(store: InMemoryStore) {
        let mut conn = store.begin(IsolationLevel::default()).await.unwrap();
        let id = stage_wallet(&mut conn);
        assert!(store.wallet_snapshot(id).is_none());
        store.commit(conn).await.unwrap();
        assert!(store.wallet_snapshot(id).is_some());
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_discard_staged_writes_when_dropped(store: InMemoryStore) {
        let mut conn = store.begin(IsolationLevel::Serializable).await.unwrap();
        assert_eq!(conn.isolation(), IsolationLevel::Serializable);
        stage_wallet(&mut conn);
        assert_eq!(store.open_claims(), 1);
        drop(conn);
        assert_eq!(store.wallet_count(), 0);
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_refuse_a_row_claimed_by_another_boundary(store: InMemoryStore) {
        let mut first = store.begin(IsolationLevel::default()).await.unwrap();
        let mut second = store.begin(IsolationLevel::default()).await.unwrap();
        let id = stage_wallet(&mut first);
        let claimed = second.with_tables(|tables, _, session| tables.claim(RowKey::Wallet(id), session));
        assert!(!claimed);
        store.rollback(first).await.unwrap();
        let claimed = second.with_tables(|tables, _, session| tables.claim(RowKey::Wallet(id), session));
        assert!(claimed);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_fail_injected_commits_and_drop_their_writes(store: InMemoryStore) {
        store.fail_next_commits(1, InfraKind::SerializationFailure);
        let mut conn = store.begin(IsolationLevel::default()).await.unwrap();
        stage_wallet(&mut conn);
        let err = store.commit(conn).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.wallet_count(), 0);
        assert_eq!(store.open_claims(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn it_should_refuse_to_begin_while_offline(store: InMemoryStore) {
        store.toggle_offline();
        let err = store.begin(IsolationLevel::default()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Infrastructure { kind: InfraKind::Connection, .. }
        ));
        store.toggle_offline();
        assert!(store.begin(IsolationLevel::default()).await.is_ok());
    }
}
