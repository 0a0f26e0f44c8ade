// PostgreSQL store.
//
// Purpose
// - Back the unit of work with real database transactions.
//
// Responsibilities
// - One pooled connection per boundary, opened with `BEGIN` and the requested isolation level.
// - Map driver failures onto the ledger error taxonomy, so retry decisions never look at sqlx types.
//
// Boundaries
// - Optimistic checks live in the repositories (compare-and-swap on version columns). This module only
//   owns connections and transactions.

use crate::shared::core::errors::{InfraKind, LedgerError};
use crate::shared::core::unit_of_work::{IsolationLevel, TransactionalStore};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;

pub type PgConn = Transaction<'static, Postgres>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        tracing::info!(
            max_connections = settings.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| LedgerError::infrastructure(InfraKind::Backend, err.to_string()))?;
        tracing::info!("ledger schema migrated");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    type Conn = PgConn;

    async fn begin(&self, isolation: IsolationLevel) -> Result<PgConn, LedgerError> {
        let mut conn = self.pool.begin().await.map_err(map_sqlx_error)?;
        // Must be the first statement of the transaction.
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
        Ok(conn)
    }

    async fn commit(&self, conn: PgConn) -> Result<(), LedgerError> {
        conn.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&self, conn: PgConn) -> Result<(), LedgerError> {
        conn.rollback().await.map_err(map_sqlx_error)
    }
}

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

pub fn map_sqlx_error(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE) => {
                LedgerError::infrastructure(InfraKind::SerializationFailure, db.message())
            }
            Some(DEADLOCK_DETECTED) => LedgerError::infrastructure(InfraKind::Deadlock, db.message()),
            Some(UNIQUE_VIOLATION) => {
                let constraint = db.constraint().unwrap_or_default();
                LedgerError::duplicate(entity_of_constraint(constraint), constraint)
            }
            _ => LedgerError::infrastructure(InfraKind::Backend, db.message()),
        },
        sqlx::Error::PoolTimedOut => LedgerError::infrastructure(InfraKind::Timeout, err.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            LedgerError::infrastructure(InfraKind::Connection, err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            LedgerError::infrastructure(InfraKind::Codec, err.to_string())
        }
        _ => LedgerError::infrastructure(InfraKind::Backend, err.to_string()),
    }
}

/// Constraint names start with their table: `wallets_owner_currency_key`, `transactions_idempotency_key_key`.
fn entity_of_constraint(constraint: &str) -> &'static str {
    if constraint.starts_with("wallets") {
        "wallet"
    } else if constraint.starts_with("transactions") {
        "transaction"
    } else if constraint.starts_with("outbox") {
        "outbox_entry"
    } else {
        "row"
    }
}

pub(crate) fn codec_error(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::infrastructure(InfraKind::Codec, err.to_string())
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
