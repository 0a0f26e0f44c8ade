use crate::modules::transactions::core::ports::{TransactionFilter, TransactionRepository};
use crate::modules::transactions::core::transaction::{
    NON_RETRYABLE_REASONS, Transaction, TransactionSnapshot,
};
use crate::shared::core::errors::LedgerError;
use crate::shared::core::primitives::{Currency, Money};
use crate::shared::core::unit_of_work::Tx;
use crate::shared::infrastructure::postgres::{PgConn, codec_error, map_sqlx_error, to_i64};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "id, wallet_id, idempotency_key, transaction_type, status, amount, \
     currency, destination_wallet_id, external_reference, description, metadata, failure_reason, \
     retry_count, version, created_at, updated_at, processed_at, completed_at";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    wallet_id: Uuid,
    idempotency_key: String,
    transaction_type: String,
    status: String,
    amount: i64,
    currency: String,
    destination_wallet_id: Option<Uuid>,
    external_reference: Option<String>,
    description: String,
    metadata: serde_json::Value,
    failure_reason: Option<String>,
    retry_count: i32,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    fn into_transaction(self) -> Result<Transaction, LedgerError> {
        let currency = Currency::new(&self.currency).map_err(codec_error)?;
        Ok(Transaction::restore(TransactionSnapshot {
            id: self.id,
            wallet_id: self.wallet_id,
            idempotency_key: self.idempotency_key,
            transaction_type: self.transaction_type.parse().map_err(codec_error)?,
            status: self.status.parse().map_err(codec_error)?,
            amount: Money::positive(self.amount, currency).map_err(codec_error)?,
            destination_wallet_id: self.destination_wallet_id,
            external_reference: self.external_reference,
            description: self.description,
            metadata: serde_json::from_value(self.metadata).map_err(codec_error)?,
            failure_reason: self.failure_reason,
            retry_count: u32::try_from(self.retry_count).map_err(codec_error)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processed_at: self.processed_at,
            completed_at: self.completed_at,
        }))
    }
}

type RowQuery<'q> = QueryAs<'q, sqlx::Postgres, TransactionRow, PgArguments>;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresTransactionRepository;

impl PostgresTransactionRepository {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_many(
        tx: &mut Tx<PgConn>,
        query: RowQuery<'_>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        query
            .fetch_all(&mut **tx.conn())
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(TransactionRow::into_transaction)
            .collect()
    }
}

#[async_trait]
impl TransactionRepository<PgConn> for PostgresTransactionRepository {
    async fn save(
        &self,
        tx: &mut Tx<PgConn>,
        transaction: &mut Transaction,
    ) -> Result<(), LedgerError> {
        let s = transaction.snapshot();
        let metadata = serde_json::to_value(&s.metadata)?;
        let retry_count = i32::try_from(s.retry_count).map_err(codec_error)?;
        match transaction.persisted_version() {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES \
                     ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
                ))
                .bind(s.id)
                .bind(s.wallet_id)
                .bind(&s.idempotency_key)
                .bind(s.transaction_type.as_str())
                .bind(s.status.as_str())
                .bind(s.amount.amount())
                .bind(s.amount.currency().code())
                .bind(s.destination_wallet_id)
                .bind(&s.external_reference)
                .bind(&s.description)
                .bind(&metadata)
                .bind(&s.failure_reason)
                .bind(retry_count)
                .bind(s.version)
                .bind(s.created_at)
                .bind(s.updated_at)
                .bind(s.processed_at)
                .bind(s.completed_at)
                .execute(&mut **tx.conn())
                .await
                .map_err(|err| match map_sqlx_error(err) {
                    LedgerError::Duplicate { entity, .. } => {
                        LedgerError::duplicate(entity, &s.idempotency_key)
                    }
                    other => other,
                })?;
            }
            Some(expected) => {
                let updated = sqlx::query(
                    "UPDATE transactions SET status = $1, description = $2, metadata = $3, \
                     failure_reason = $4, retry_count = $5, version = $6, updated_at = $7, \
                     processed_at = $8, completed_at = $9, external_reference = $10 \
                     WHERE id = $11 AND version = $12",
                )
                .bind(s.status.as_str())
                .bind(&s.description)
                .bind(&metadata)
                .bind(&s.failure_reason)
                .bind(retry_count)
                .bind(s.version)
                .bind(s.updated_at)
                .bind(s.processed_at)
                .bind(s.completed_at)
                .bind(&s.external_reference)
                .bind(s.id)
                .bind(expected)
                .execute(&mut **tx.conn())
                .await
                .map_err(map_sqlx_error)?;
                if updated.rows_affected() == 0 {
                    return Err(LedgerError::concurrency("transaction", s.id, expected));
                }
            }
        }
        transaction.mark_persisted();
        Ok(())
    }

    async fn find_by_id(&self, tx: &mut Tx<PgConn>, id: Uuid) -> Result<Transaction, LedgerError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| LedgerError::not_found("transaction", id))?
        .into_transaction()
    }

    async fn find_by_idempotency_key(
        &self,
        tx: &mut Tx<PgConn>,
        key: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?
        .map(TransactionRow::into_transaction)
        .transpose()
    }

    async fn find_by_wallet_id(
        &self,
        tx: &mut Tx<PgConn>,
        wallet_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE wallet_id = $1 \
             ORDER BY created_at DESC OFFSET $2 LIMIT $3"
        );
        let query = sqlx::query_as(&sql)
            .bind(wallet_id)
            .bind(to_i64(offset))
            .bind(to_i64(limit));
        Self::fetch_many(tx, query).await
    }

    async fn find_pending_by_wallet(
        &self,
        tx: &mut Tx<PgConn>,
        wallet_id: Uuid,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE wallet_id = $1 AND status = 'PENDING' ORDER BY created_at"
        );
        Self::fetch_many(tx, sqlx::query_as(&sql).bind(wallet_id)).await
    }

    async fn find_failed_retryable(
        &self,
        tx: &mut Tx<PgConn>,
        max_retries: u32,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE status = 'FAILED' AND retry_count < $1 \
               AND (failure_reason IS NULL OR failure_reason <> ALL($2)) \
             ORDER BY updated_at LIMIT $3"
        );
        let excluded: Vec<String> = NON_RETRYABLE_REASONS.iter().map(|r| r.to_string()).collect();
        let query = sqlx::query_as(&sql)
            .bind(i64::from(max_retries))
            .bind(excluded)
            .bind(to_i64(limit));
        Self::fetch_many(tx, query).await
    }

    async fn list(
        &self,
        tx: &mut Tx<PgConn>,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE ($1::uuid IS NULL OR wallet_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::text IS NULL OR transaction_type = $3) \
               AND ($4::timestamptz IS NULL OR created_at >= $4) \
               AND ($5::timestamptz IS NULL OR created_at < $5) \
             ORDER BY created_at DESC OFFSET $6 LIMIT $7"
        );
        let query = sqlx::query_as(&sql)
            .bind(filter.wallet_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.transaction_type.map(|t| t.as_str()))
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(to_i64(offset))
            .bind(to_i64(limit));
        Self::fetch_many(tx, query).await
    }
}
