// Ports for the atomic boundary every ledger mutation runs in.
//
// Purpose
// - Describe what the core needs from a store to open, commit, and roll back one atomic unit.
// - Define the transaction-scoped handle that is passed, by parameter, to every repository call made
//   inside that unit.
//
// Boundaries
// - No concrete store here. The in-memory and Postgres adapters implement `TransactionalStore`.

use crate::shared::core::errors::LedgerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(LedgerError::validation(
                "isolation_level",
                format!("unknown isolation level '{other}'"),
            )),
        }
    }
}

/// Transaction-scoped handle. Everything done through one `Tx` commits or rolls back together.
///
/// Dropping a `Tx` without committing rolls it back: the connection types of both adapters undo their
/// work on drop, so an aborted or cancelled boundary never leaves a partial commit behind.
pub struct Tx<C> {
    conn: C,
    id: Uuid,
    isolation: IsolationLevel,
    depth: u32,
}

impl<C: Send> Tx<C> {
    pub fn new(conn: C, isolation: IsolationLevel) -> Self {
        Self {
            conn,
            id: Uuid::now_v7(),
            isolation,
            depth: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// How many `nested` calls are currently running inside this boundary.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn conn(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_conn(self) -> C {
        self.conn
    }

    /// Run `op` inside this boundary instead of opening a new one. Only the outermost boundary commits
    /// or rolls back, so an error here surfaces to the owner of the boundary unchanged.
    pub async fn nested<T, F>(&mut self, op: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx<C>) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        self.depth += 1;
        tracing::trace!(boundary = %self.id, depth = self.depth, "joining open unit of work");
        let result = op(self).await;
        self.depth -= 1;
        result
    }
}

#[async_trait]
pub trait TransactionalStore: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Conn, LedgerError>;
    async fn commit(&self, conn: Self::Conn) -> Result<(), LedgerError>;
    async fn rollback(&self, conn: Self::Conn) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod isolation_level_tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("read_committed", IsolationLevel::ReadCommitted)]
    #[case("READ COMMITTED", IsolationLevel::ReadCommitted)]
    #[case("repeatable-read", IsolationLevel::RepeatableRead)]
    #[case("Serializable", IsolationLevel::Serializable)]
    fn it_should_parse_isolation_levels(#[case] raw: &str, #[case] expected: IsolationLevel) {
        assert_eq!(raw.parse::<IsolationLevel>().unwrap(), expected);
    }

    #[rstest]
    fn it_should_default_to_read_committed() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }
}
