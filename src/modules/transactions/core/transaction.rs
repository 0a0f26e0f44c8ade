// Transaction aggregate: one ledger operation identified by a caller-supplied idempotency key.
//
// Responsibilities
// - Own the status state machine: PENDING -> PROCESSING -> COMPLETED | FAILED, PENDING -> CANCELLED,
//   PENDING -> FAILED, and FAILED -> PENDING through a bounded `retry`.
// - Refuse every mutation on a terminal transaction.
// - Bump `version` on every change; repositories use the loaded version as compare-and-swap token.
//
// Boundaries
// - No input or output. The idempotency check itself lives in the use case and the repository.

use crate::modules::transactions::core::events::TransactionEvent;
use crate::shared::core::domain_event::DomainEvent;
use crate::shared::core::errors::{LedgerError, RuleCode};
use crate::shared::core::primitives::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Failure reasons that no amount of retrying will fix.
pub const NON_RETRYABLE_REASONS: [&str; 5] = [
    "INVALID_ACCOUNT",
    "ACCOUNT_CLOSED",
    "INSUFFICIENT_BALANCE",
    "FRAUD_DETECTED",
    "BLACKLISTED",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdraw,
    Payout,
    Transfer,
    Fee,
    Refund,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdraw => "WITHDRAW",
            TransactionType::Payout => "PAYOUT",
            TransactionType::Transfer => "TRANSFER",
            TransactionType::Fee => "FEE",
            TransactionType::Refund => "REFUND",
            TransactionType::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(TransactionType::Deposit),
            "WITHDRAW" => Ok(TransactionType::Withdraw),
            "PAYOUT" => Ok(TransactionType::Payout),
            "TRANSFER" => Ok(TransactionType::Transfer),
            "FEE" => Ok(TransactionType::Fee),
            "REFUND" => Ok(TransactionType::Refund),
            "ADJUSTMENT" => Ok(TransactionType::Adjustment),
            other => Err(LedgerError::validation(
                "transaction_type",
                format!("unknown transaction type '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            other => Err(LedgerError::validation(
                "status",
                format!("unknown transaction status '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub wallet_id: Uuid,
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub description: String,
    pub external_reference: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Stored representation of a transaction, as read back from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Money,
    pub destination_wallet_id: Option<Uuid>,
    pub external_reference: Option<String>,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    state: TransactionSnapshot,
    persisted_version: Option<i64>,
    events: Vec<DomainEvent<TransactionEvent>>,
}

impl Transaction {
    pub fn create(new: NewTransaction) -> Result<Self, LedgerError> {
        let key = new.idempotency_key.trim();
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(LedgerError::validation(
                "idempotency_key",
                format!("must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} characters"),
            ));
        }
        if new.amount.amount() <= 0 {
            return Err(LedgerError::validation(
                "amount",
                format!("transaction amount must be greater than zero, got {}", new.amount),
            ));
        }
        let now = Utc::now();
        let id = Uuid::now_v7();
        let state = TransactionSnapshot {
            id,
            wallet_id: new.wallet_id,
            idempotency_key: key.to_string(),
            transaction_type: new.transaction_type,
            status: TransactionStatus::Pending,
            amount: new.amount,
            destination_wallet_id: None,
            external_reference: new.external_reference,
            description: new.description,
            metadata: new.metadata,
            failure_reason: None,
            retry_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            processed_at: None,
            completed_at: None,
        };
        let created = TransactionEvent::TransactionCreated {
            wallet_id: state.wallet_id,
            idempotency_key: state.idempotency_key.clone(),
            transaction_type: state.transaction_type,
            amount: state.amount.clone(),
        };
        Ok(Self {
            state,
            persisted_version: None,
            events: vec![DomainEvent::new(id, now, created)],
        })
    }

    pub fn restore(snapshot: TransactionSnapshot) -> Self {
        Self {
            persisted_version: Some(snapshot.version),
            state: snapshot,
            events: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        self.state.clone()
    }

    pub fn start_processing(&mut self) -> Result<(), LedgerError> {
        self.ensure_status(TransactionStatus::Pending, "start processing")?;
        let now = Utc::now();
        self.state.status = TransactionStatus::Processing;
        self.state.processed_at = Some(now);
        self.record(now, |version| TransactionEvent::TransactionProcessing { version });
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), LedgerError> {
        self.ensure_status(TransactionStatus::Processing, "complete")?;
        let now = Utc::now();
        self.state.status = TransactionStatus::Completed;
        self.state.completed_at = Some(now);
        self.record(now, |version| TransactionEvent::TransactionCompleted { version });
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), LedgerError> {
        self.ensure_not_terminal()?;
        let reason = reason.into();
        let now = Utc::now();
        self.state.status = TransactionStatus::Failed;
        self.state.failure_reason = Some(reason.clone());
        self.state.completed_at = Some(now);
        self.record(now, |version| TransactionEvent::TransactionFailed { reason, version });
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), LedgerError> {
        self.ensure_status(TransactionStatus::Pending, "cancel")?;
        let now = Utc::now();
        self.state.status = TransactionStatus::Cancelled;
        self.record(now, |version| TransactionEvent::TransactionCancelled { version });
        Ok(())
    }

    /// Return a FAILED transaction to PENDING. `max_retries` counts retries, not attempts, and is
    /// checked before the counter is incremented.
    pub fn retry(&mut self, max_retries: u32) -> Result<(), LedgerError> {
        if self.state.status != TransactionStatus::Failed {
            return Err(LedgerError::rule(
                RuleCode::CannotRetryNonFailedTransaction,
                format!("transaction {} is {}", self.state.id, self.state.status),
            ));
        }
        if self.state.retry_count >= max_retries {
            return Err(LedgerError::rule(
                RuleCode::MaxRetriesExceeded,
                format!(
                    "transaction {} already retried {} of {max_retries} times",
                    self.state.id, self.state.retry_count
                ),
            ));
        }
        let now = Utc::now();
        self.state.status = TransactionStatus::Pending;
        self.state.retry_count += 1;
        self.state.failure_reason = None;
        self.state.completed_at = None;
        let retry_count = self.state.retry_count;
        self.record(now, |version| TransactionEvent::TransactionRetried {
            retry_count,
            version,
        });
        Ok(())
    }

    /// Advisory classification of the failure reason. Callers consult it before calling `retry`.
    pub fn is_retryable(&self) -> bool {
        is_retryable_reason(self.state.failure_reason.as_deref().unwrap_or(""))
    }

    pub fn set_destination_wallet(&mut self, destination: Uuid) -> Result<(), LedgerError> {
        self.ensure_not_terminal()?;
        if self.state.transaction_type != TransactionType::Transfer {
            return Err(LedgerError::validation(
                "destination_wallet_id",
                format!("only TRANSFER carries a destination, not {}", self.state.transaction_type),
            ));
        }
        if destination == self.state.wallet_id {
            return Err(LedgerError::validation(
                "destination_wallet_id",
                "destination must differ from the source wallet",
            ));
        }
        self.state.destination_wallet_id = Some(destination);
        self.touch();
        Ok(())
    }

    pub fn set_external_reference(&mut self, reference: impl Into<String>) -> Result<(), LedgerError> {
        self.ensure_not_terminal()?;
        self.state.external_reference = Some(reference.into());
        self.touch();
        Ok(())
    }

    pub fn add_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.ensure_not_terminal()?;
        self.state.metadata.insert(key.into(), value.into());
        self.touch();
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent<TransactionEvent>> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> &[DomainEvent<TransactionEvent>] {
        &self.events
    }

    pub fn mark_persisted(&mut self) {
        self.persisted_version = Some(self.state.version);
    }

    pub fn persisted_version(&self) -> Option<i64> {
        self.persisted_version
    }

    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn wallet_id(&self) -> Uuid {
        self.state.wallet_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.state.idempotency_key
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.state.transaction_type
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.status
    }

    pub fn amount(&self) -> &Money {
        &self.state.amount
    }

    pub fn destination_wallet_id(&self) -> Option<Uuid> {
        self.state.destination_wallet_id
    }

    pub fn external_reference(&self) -> Option<&str> {
        self.state.external_reference.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.state.description
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.state.metadata
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.state.failure_reason.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.state.retry_count
    }

    pub fn version(&self) -> i64 {
        self.state.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.updated_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.state.processed_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.completed_at
    }

    fn record(&mut self, now: DateTime<Utc>, build: impl FnOnce(i64) -> TransactionEvent) {
        self.state.version += 1;
        self.state.updated_at = now;
        let payload = build(self.state.version);
        self.events.push(DomainEvent::new(self.state.id, now, payload));
    }

    fn touch(&mut self) {
        self.state.version += 1;
        self.state.updated_at = Utc::now();
    }

    fn ensure_not_terminal(&self) -> Result<(), LedgerError> {
        if self.state.status.is_terminal() {
            return Err(LedgerError::rule(
                RuleCode::TransactionTerminal,
                format!("transaction {} is {}", self.state.id, self.state.status),
            ));
        }
        Ok(())
    }

    fn ensure_status(&self, expected: TransactionStatus, action: &str) -> Result<(), LedgerError> {
        if self.state.status != expected {
            return Err(LedgerError::rule(
                RuleCode::InvalidStatusTransition,
                format!(
                    "cannot {action} transaction {} in status {}",
                    self.state.id, self.state.status
                ),
            ));
        }
        Ok(())
    }
}

pub fn is_retryable_reason(reason: &str) -> bool {
    !NON_RETRYABLE_REASONS.contains(&reason)
}
