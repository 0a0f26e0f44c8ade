use crate::modules::wallets::core::ports::{WalletFilter, WalletRepository};
use crate::modules::wallets::core::wallet::{Wallet, WalletSnapshot};
use crate::shared::core::errors::LedgerError;
use crate::shared::core::primitives::{Currency, Money};
use crate::shared::core::unit_of_work::Tx;
use crate::shared::infrastructure::postgres::{PgConn, codec_error, map_sqlx_error, to_i64};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

const WALLET_COLUMNS: &str = "id, owner_id, currency, wallet_type, status, available, pending, \
     balance_version, daily_limit, monthly_limit, created_at, updated_at";

#[derive(Debug, FromRow)]
struct WalletRow {
    id: Uuid,
    owner_id: Uuid,
    currency: String,
    wallet_type: String,
    status: String,
    available: i64,
    pending: i64,
    balance_version: i64,
    daily_limit: i64,
    monthly_limit: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WalletRow {
    fn into_wallet(self) -> Result<Wallet, LedgerError> {
        let currency = Currency::new(&self.currency).map_err(codec_error)?;
        let money = |amount: i64| Money::new(amount, currency.clone()).map_err(codec_error);
        Wallet::restore(WalletSnapshot {
            id: self.id,
            owner_id: self.owner_id,
            wallet_type: self.wallet_type.parse().map_err(codec_error)?,
            status: self.status.parse().map_err(codec_error)?,
            available: money(self.available)?,
            pending: money(self.pending)?,
            version: self.balance_version,
            daily_limit: money(self.daily_limit)?,
            monthly_limit: money(self.monthly_limit)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            currency,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresWalletRepository;

impl PostgresWalletRepository {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_many(
        tx: &mut Tx<PgConn>,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, WalletRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Wallet>, LedgerError> {
        query
            .fetch_all(&mut **tx.conn())
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(WalletRow::into_wallet)
            .collect()
    }
}

#[async_trait]
impl WalletRepository<PgConn> for PostgresWalletRepository {
    async fn save(&self, tx: &mut Tx<PgConn>, wallet: &mut Wallet) -> Result<(), LedgerError> {
        let s = wallet.snapshot();
        match wallet.persisted_version() {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO wallets ({WALLET_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
                ))
                .bind(s.id)
                .bind(s.owner_id)
                .bind(s.currency.code())
                .bind(s.wallet_type.as_str())
                .bind(s.status.as_str())
                .bind(s.available.amount())
                .bind(s.pending.amount())
                .bind(s.version)
                .bind(s.daily_limit.amount())
                .bind(s.monthly_limit.amount())
                .bind(s.created_at)
                .bind(s.updated_at)
                .execute(&mut **tx.conn())
                .await
                .map_err(|err| match map_sqlx_error(err) {
                    LedgerError::Duplicate { entity, .. } => {
                        LedgerError::duplicate(entity, format!("{}/{}", s.owner_id, s.currency))
                    }
                    other => other,
                })?;
            }
            Some(expected) => {
                let updated = sqlx::query(
                    "UPDATE wallets SET status = $1, available = $2, pending = $3, \
                     balance_version = $4, daily_limit = $5, monthly_limit = $6, updated_at = $7 \
                     WHERE id = $8 AND balance_version = $9",
                )
                .bind(s.status.as_str())
                .bind(s.available.amount())
                .bind(s.pending.amount())
                .bind(s.version)
                .bind(s.daily_limit.amount())
                .bind(s.monthly_limit.amount())
                .bind(s.updated_at)
                .bind(s.id)
                .bind(expected)
                .execute(&mut **tx.conn())
                .await
                .map_err(map_sqlx_error)?;
                if updated.rows_affected() == 0 {
                    return Err(LedgerError::concurrency("wallet", s.id, expected));
                }
            }
        }
        wallet.mark_persisted();
        Ok(())
    }

    async fn find_by_id(&self, tx: &mut Tx<PgConn>, id: Uuid) -> Result<Wallet, LedgerError> {
        sqlx::query_as::<_, WalletRow>(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut **tx.conn())
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| LedgerError::not_found("wallet", id))?
            .into_wallet()
    }

    async fn find_by_owner_and_currency(
        &self,
        tx: &mut Tx<PgConn>,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<Wallet, LedgerError> {
        sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = $1 AND currency = $2"
        ))
        .bind(owner_id)
        .bind(currency.code())
        .fetch_optional(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| LedgerError::not_found("wallet", format!("{owner_id}/{currency}")))?
        .into_wallet()
    }

    async fn find_by_owner_id(
        &self,
        tx: &mut Tx<PgConn>,
        owner_id: Uuid,
    ) -> Result<Vec<Wallet>, LedgerError> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = $1 ORDER BY created_at");
        Self::fetch_many(tx, sqlx::query_as(&sql).bind(owner_id)).await
    }

    async fn exists_by_owner_and_currency(
        &self,
        tx: &mut Tx<PgConn>,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<bool, LedgerError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM wallets WHERE owner_id = $1 AND currency = $2)",
        )
        .bind(owner_id)
        .bind(currency.code())
        .fetch_one(&mut **tx.conn())
        .await
        .map_err(map_sqlx_error)
    }

    async fn list(
        &self,
        tx: &mut Tx<PgConn>,
        filter: &WalletFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Wallet>, LedgerError> {
        let sql = format!(
            "SELECT {WALLET_COLUMNS} FROM wallets \
             WHERE ($1::uuid IS NULL OR owner_id = $1) \
               AND ($2::text IS NULL OR currency = $2) \
               AND ($3::text IS NULL OR status = $3) \
               AND ($4::text IS NULL OR wallet_type = $4) \
             ORDER BY created_at \
             OFFSET $5 LIMIT $6"
        );
        let query = sqlx::query_as(&sql)
            .bind(filter.owner_id)
            .bind(filter.currency.as_ref().map(|c| c.code().to_string()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.wallet_type.map(|t| t.as_str()))
            .bind(to_i64(offset))
            .bind(to_i64(limit));
        Self::fetch_many(tx, query).await
    }
}

#[cfg(test)]
mod postgres_wallet_repository_tests {
    use super::*;
    use rstest::rstest;

    fn row() -> WalletRow {
        WalletRow {
            id: Uuid::now_v7(),
            owner_id: Uuid::now_v7(),
            currency: "USD".to_string(),
            wallet_type: "FIAT".to_string(),
            status: "ACTIVE".to_string(),
            available: 120,
            pending: 30,
            balance_version: 4,
            daily_limit: 1_000,
            monthly_limit: 10_000,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[rstest]
    fn it_should_rebuild_a_persisted_wallet_from_its_row() {
        let wallet = row().into_wallet().unwrap();
        assert_eq!(wallet.available().amount(), 120);
        assert_eq!(wallet.pending().amount(), 30);
        assert_eq!(wallet.version(), 4);
        assert_eq!(wallet.persisted_version(), Some(4));
    }

    #[rstest]
    fn it_should_keep_a_ticker_longer_than_three_letters() {
        let mut crypto = row();
        crypto.currency = "USDT".to_string();
        crypto.wallet_type = "CRYPTO".to_string();
        let wallet = crypto.into_wallet().unwrap();
        assert_eq!(wallet.currency().code(), "USDT");
        assert_eq!(wallet.available().currency().code(), "USDT");
    }

    #[rstest]
    fn it_should_report_a_corrupt_row_as_a_codec_failure() {
        let mut corrupt = row();
        corrupt.status = "HIBERNATING".to_string();
        assert!(matches!(
            corrupt.into_wallet().unwrap_err(),
            LedgerError::Infrastructure { .. }
        ));
    }
}
