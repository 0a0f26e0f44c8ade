// Wallet aggregate: one owner's balance in one currency.
//
// Responsibilities
// - Own the balance state machine. Every successful operation bumps `version` by exactly one and records
//   one event; a rejected operation leaves the wallet untouched.
// - Remember the version it was loaded at. Repositories use it as the compare-and-swap token on save.
//
// Boundaries
// - No input or output. Fields are private; the only way to change a wallet is through its methods.

use crate::modules::wallets::core::events::{BalanceMovement, WalletEvent};
use crate::shared::core::domain_event::DomainEvent;
use crate::shared::core::errors::{LedgerError, RuleCode};
use crate::shared::core::primitives::{Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletType {
    Fiat,
    Crypto,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletType::Fiat => "FIAT",
            WalletType::Crypto => "CRYPTO",
        }
    }
}

impl FromStr for WalletType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIAT" => Ok(WalletType::Fiat),
            "CRYPTO" => Ok(WalletType::Crypto),
            other => Err(LedgerError::validation(
                "wallet_type",
                format!("unknown wallet type '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Active,
    Suspended,
    Locked,
    Closed,
}

impl WalletStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Active => "ACTIVE",
            WalletStatus::Suspended => "SUSPENDED",
            WalletStatus::Locked => "LOCKED",
            WalletStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(WalletStatus::Active),
            "SUSPENDED" => Ok(WalletStatus::Suspended),
            "LOCKED" => Ok(WalletStatus::Locked),
            "CLOSED" => Ok(WalletStatus::Closed),
            other => Err(LedgerError::validation(
                "status",
                format!("unknown wallet status '{other}'"),
            )),
        }
    }
}

/// Stored representation of a wallet, as read back from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub currency: Currency,
    pub wallet_type: WalletType,
    pub status: WalletStatus,
    pub available: Money,
    pub pending: Money,
    pub version: i64,
    pub daily_limit: Money,
    pub monthly_limit: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    id: Uuid,
    owner_id: Uuid,
    currency: Currency,
    wallet_type: WalletType,
    status: WalletStatus,
    available: Money,
    pending: Money,
    version: i64,
    daily_limit: Money,
    monthly_limit: Money,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    persisted_version: Option<i64>,
    events: Vec<DomainEvent<WalletEvent>>,
}

impl Wallet {
    pub fn open(
        owner_id: Uuid,
        currency: Currency,
        wallet_type: WalletType,
        daily_limit: Money,
        monthly_limit: Money,
    ) -> Result<Self, LedgerError> {
        validate_limits(&currency, &daily_limit, &monthly_limit)?;
        let now = Utc::now();
        let id = Uuid::now_v7();
        let mut wallet = Self {
            id,
            owner_id,
            available: Money::zero(currency.clone()),
            pending: Money::zero(currency.clone()),
            currency: currency.clone(),
            wallet_type,
            status: WalletStatus::Active,
            version: 0,
            daily_limit,
            monthly_limit,
            created_at: now,
            updated_at: now,
            persisted_version: None,
            events: Vec::new(),
        };
        wallet.events.push(DomainEvent::new(
            id,
            now,
            WalletEvent::WalletOpened {
                owner_id,
                currency,
                wallet_type,
            },
        ));
        Ok(wallet)
    }

    /// Rebuild a wallet from storage. The stored version becomes the optimistic-lock token.
    pub fn restore(snapshot: WalletSnapshot) -> Result<Self, LedgerError> {
        snapshot.available.ensure_currency(&snapshot.currency)?;
        snapshot.pending.ensure_currency(&snapshot.currency)?;
        snapshot.daily_limit.ensure_currency(&snapshot.currency)?;
        snapshot.monthly_limit.ensure_currency(&snapshot.currency)?;
        Ok(Self {
            id: snapshot.id,
            owner_id: snapshot.owner_id,
            currency: snapshot.currency,
            wallet_type: snapshot.wallet_type,
            status: snapshot.status,
            available: snapshot.available,
            pending: snapshot.pending,
            version: snapshot.version,
            daily_limit: snapshot.daily_limit,
            monthly_limit: snapshot.monthly_limit,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            persisted_version: Some(snapshot.version),
            events: Vec::new(),
        })
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            id: self.id,
            owner_id: self.owner_id,
            currency: self.currency.clone(),
            wallet_type: self.wallet_type,
            status: self.status,
            available: self.available.clone(),
            pending: self.pending.clone(),
            version: self.version,
            daily_limit: self.daily_limit.clone(),
            monthly_limit: self.monthly_limit.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn credit(&mut self, amount: &Money) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        amount.ensure_currency(&self.currency)?;
        self.available = self.available.checked_add(amount)?;
        self.record(|w| WalletEvent::WalletCredited(w.movement(amount)));
        Ok(())
    }

    pub fn debit(&mut self, amount: &Money) -> Result<(), LedgerError> {
        self.ensure_active()?;
        amount.ensure_currency(&self.currency)?;
        self.ensure_available(amount)?;
        self.available = self.available.checked_sub(amount)?;
        self.record(|w| WalletEvent::WalletDebited(w.movement(amount)));
        Ok(())
    }

    /// Hold funds for a two-phase flow: they leave `available` and wait in `pending`.
    pub fn reserve(&mut self, amount: &Money) -> Result<(), LedgerError> {
        self.ensure_active()?;
        amount.ensure_currency(&self.currency)?;
        self.ensure_available(amount)?;
        let available = self.available.checked_sub(amount)?;
        let pending = self.pending.checked_add(amount)?;
        self.available = available;
        self.pending = pending;
        self.record(|w| WalletEvent::FundsReserved(w.movement(amount)));
        Ok(())
    }

    pub fn release(&mut self, amount: &Money) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        amount.ensure_currency(&self.currency)?;
        self.ensure_pending(amount)?;
        let pending = self.pending.checked_sub(amount)?;
        let available = self.available.checked_add(amount)?;
        self.available = available;
        self.pending = pending;
        self.record(|w| WalletEvent::FundsReleased(w.movement(amount)));
        Ok(())
    }

    /// Settle previously reserved funds; `available` is not touched.
    pub fn complete_pending(&mut self, amount: &Money) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        amount.ensure_currency(&self.currency)?;
        self.ensure_pending(amount)?;
        self.pending = self.pending.checked_sub(amount)?;
        self.record(|w| WalletEvent::PendingCompleted(w.movement(amount)));
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        self.status = WalletStatus::Suspended;
        self.record(|w| WalletEvent::WalletSuspended { version: w.version });
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        self.status = WalletStatus::Active;
        self.record(|w| WalletEvent::WalletActivated { version: w.version });
        Ok(())
    }

    pub fn lock(&mut self) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        self.status = WalletStatus::Locked;
        self.record(|w| WalletEvent::WalletLocked { version: w.version });
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        if !self.available.is_zero() || !self.pending.is_zero() {
            return Err(LedgerError::rule(
                RuleCode::WalletHasBalance,
                format!(
                    "wallet {} still holds {} available and {} pending",
                    self.id, self.available, self.pending
                ),
            ));
        }
        self.status = WalletStatus::Closed;
        self.record(|w| WalletEvent::WalletClosed { version: w.version });
        Ok(())
    }

    pub fn update_limits(&mut self, daily: Money, monthly: Money) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        validate_limits(&self.currency, &daily, &monthly)?;
        self.daily_limit = daily;
        self.monthly_limit = monthly;
        self.record(|w| WalletEvent::WalletLimitsUpdated {
            daily_limit: w.daily_limit.clone(),
            monthly_limit: w.monthly_limit.clone(),
            version: w.version,
        });
        Ok(())
    }

    /// Drain the events recorded since the last call, in the order they happened.
    pub fn take_events(&mut self) -> Vec<DomainEvent<WalletEvent>> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> &[DomainEvent<WalletEvent>] {
        &self.events
    }

    /// Called by repositories once a save has been staged: the current version becomes the new token.
    pub fn mark_persisted(&mut self) {
        self.persisted_version = Some(self.version);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn wallet_type(&self) -> WalletType {
        self.wallet_type
    }

    pub fn status(&self) -> WalletStatus {
        self.status
    }

    pub fn available(&self) -> &Money {
        &self.available
    }

    pub fn pending(&self) -> &Money {
        &self.pending
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn persisted_version(&self) -> Option<i64> {
        self.persisted_version
    }

    pub fn daily_limit(&self) -> &Money {
        &self.daily_limit
    }

    pub fn monthly_limit(&self) -> &Money {
        &self.monthly_limit
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn record(&mut self, build: impl FnOnce(&Wallet) -> WalletEvent) {
        self.version += 1;
        self.updated_at = Utc::now();
        let payload = build(self);
        self.events
            .push(DomainEvent::new(self.id, self.updated_at, payload));
    }

    fn movement(&self, amount: &Money) -> BalanceMovement {
        BalanceMovement {
            amount: amount.clone(),
            available: self.available.clone(),
            pending: self.pending.clone(),
            version: self.version,
        }
    }

    fn ensure_not_closed(&self) -> Result<(), LedgerError> {
        if self.status == WalletStatus::Closed {
            return Err(LedgerError::rule(
                RuleCode::WalletClosed,
                format!("wallet {} is closed", self.id),
            ));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), LedgerError> {
        self.ensure_not_closed()?;
        if self.status != WalletStatus::Active {
            return Err(LedgerError::rule(
                RuleCode::WalletNotActive,
                format!("wallet {} is {}", self.id, self.status),
            ));
        }
        Ok(())
    }

    fn ensure_available(&self, amount: &Money) -> Result<(), LedgerError> {
        if !self.available.covers(amount)? {
            return Err(LedgerError::rule(
                RuleCode::InsufficientBalance,
                format!("requested {amount}, available {}", self.available),
            ));
        }
        Ok(())
    }

    fn ensure_pending(&self, amount: &Money) -> Result<(), LedgerError> {
        if !self.pending.covers(amount)? {
            return Err(LedgerError::rule(
                RuleCode::InsufficientPendingBalance,
                format!("requested {amount}, pending {}", self.pending),
            ));
        }
        Ok(())
    }
}

fn validate_limits(currency: &Currency, daily: &Money, monthly: &Money) -> Result<(), LedgerError> {
    daily.ensure_currency(currency)?;
    monthly.ensure_currency(currency)?;
    if daily.amount() > monthly.amount() {
        return Err(LedgerError::validation(
            "daily_limit",
            format!("daily limit {daily} exceeds monthly limit {monthly}"),
        ));
    }
    Ok(())
}
