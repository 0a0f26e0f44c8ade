// Runtime configuration.
//
// Purpose
// - Read every tunable of the ledger from the environment once, at startup.
//
// Responsibilities
// - `from_env` loads `.env` when present, then delegates to `from_lookup`, which tests drive with a map.
// - Unset keys fall back to defaults; malformed or out-of-range values are reported with their key,
//   never ignored.

use crate::modules::wallets::use_cases::open_wallet::command::DefaultLimits;
use crate::shared::application::unit_of_work::UnitOfWorkConfig;
use crate::shared::core::unit_of_work::IsolationLevel;
use crate::shared::infrastructure::outbox::relay::RelayConfig;
use crate::shared::infrastructure::postgres::PoolSettings;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub database_url: String,
    pub pool: PoolSettings,
    pub isolation: IsolationLevel,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub boundary_timeout: Option<Duration>,
    pub conflict_retries: u32,
    pub transaction_max_retries: u32,
    pub default_limits: DefaultLimits,
    pub relay: RelayConfig,
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);
        let database_url = env
            .raw("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let isolation = match env.raw("LEDGER_ISOLATION_LEVEL") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "LEDGER_ISOLATION_LEVEL",
                value: raw,
            })?,
            None => IsolationLevel::default(),
        };
        let default_limits = DefaultLimits::default();

        Ok(Self {
            database_url,
            pool: PoolSettings {
                max_connections: env.parse("DB_MAX_CONNECTIONS", 10)?,
                acquire_timeout: Duration::from_secs(env.parse("DB_ACQUIRE_TIMEOUT_SECS", 5)?),
            },
            isolation,
            retry_max_attempts: env.parse("LEDGER_RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_backoff: Duration::from_millis(env.parse("LEDGER_RETRY_BASE_BACKOFF_MS", 25)?),
            retry_max_backoff: Duration::from_millis(env.parse("LEDGER_RETRY_MAX_BACKOFF_MS", 1_000)?),
            boundary_timeout: env
                .optional::<u64>("LEDGER_BOUNDARY_TIMEOUT_MS")?
                .map(Duration::from_millis),
            conflict_retries: env.parse("LEDGER_CONFLICT_RETRIES", 3)?,
            transaction_max_retries: env.parse("TRANSACTION_MAX_RETRIES", 3)?,
            default_limits: DefaultLimits {
                daily: env.parse("WALLET_DEFAULT_DAILY_LIMIT", default_limits.daily)?,
                monthly: env.parse("WALLET_DEFAULT_MONTHLY_LIMIT", default_limits.monthly)?,
            },
            relay: RelayConfig {
                batch_size: env.parse("OUTBOX_BATCH_SIZE", 100)?,
                poll_interval: env.checked("OUTBOX_POLL_INTERVAL_MS", 1_000u64, |ms| {
                    (ms > 0).then(|| Duration::from_millis(ms))
                })?,
                retention: env.checked("OUTBOX_RETENTION_HOURS", 168i64, |hours| {
                    (hours >= 0).then_some(hours).and_then(chrono::Duration::try_hours)
                })?,
            },
        })
    }

    pub fn uow_config(&self) -> UnitOfWorkConfig {
        UnitOfWorkConfig {
            isolation: self.isolation,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_backoff: self.retry_base_backoff,
            retry_max_backoff: self.retry_max_backoff,
            timeout: self.boundary_timeout,
        }
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn optional<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        self.raw(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::Invalid { key, value })
            })
            .transpose()
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    /// Parse, then keep the value only if `accept` maps it into range.
    fn checked<T: FromStr + ToString, U>(
        &self,
        key: &'static str,
        default: T,
        accept: impl FnOnce(T) -> Option<U>,
    ) -> Result<U, ConfigError> {
        let value = self.parse(key, default)?;
        let shown = value.to_string();
        accept(value).ok_or(ConfigError::Invalid { key, value: shown })
    }
}
