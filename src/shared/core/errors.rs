// Error taxonomy for the ledger core.
//
// Purpose
// - Give callers one typed category per failure so they can branch on it: validation, business rule,
//   concurrency conflict, not found, duplicate, infrastructure.
//
// Responsibilities
// - Carry a machine-readable code for business rule violations.
// - Classify which infrastructure failures may be retried by a unit of work.
//
// Boundaries
// - Store drivers map their own errors into this enum inside the adapters. No driver error type leaks out.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCode {
    InsufficientBalance,
    InsufficientPendingBalance,
    WalletClosed,
    WalletNotActive,
    WalletHasBalance,
    CurrencyMismatch,
    InvalidStatusTransition,
    TransactionTerminal,
    CannotRetryNonFailedTransaction,
    MaxRetriesExceeded,
    OutboxEntryNotFailed,
    OutboxRetryLimitExceeded,
    OutboxEntryPublished,
}

impl RuleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            RuleCode::InsufficientPendingBalance => "INSUFFICIENT_PENDING_BALANCE",
            RuleCode::WalletClosed => "WALLET_CLOSED",
            RuleCode::WalletNotActive => "WALLET_NOT_ACTIVE",
            RuleCode::WalletHasBalance => "WALLET_HAS_BALANCE",
            RuleCode::CurrencyMismatch => "CURRENCY_MISMATCH",
            RuleCode::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            RuleCode::TransactionTerminal => "TRANSACTION_TERMINAL",
            RuleCode::CannotRetryNonFailedTransaction => "CANNOT_RETRY_NON_FAILED_TRANSACTION",
            RuleCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            RuleCode::OutboxEntryNotFailed => "OUTBOX_ENTRY_NOT_FAILED",
            RuleCode::OutboxRetryLimitExceeded => "OUTBOX_RETRY_LIMIT_EXCEEDED",
            RuleCode::OutboxEntryPublished => "OUTBOX_ENTRY_PUBLISHED",
        }
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfraKind {
    SerializationFailure,
    Deadlock,
    Connection,
    Timeout,
    Codec,
    Backend,
}

impl InfraKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InfraKind::SerializationFailure | InfraKind::Deadlock | InfraKind::Connection
        )
    }
}

impl fmt::Display for InfraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InfraKind::SerializationFailure => "serialization failure",
            InfraKind::Deadlock => "deadlock",
            InfraKind::Connection => "connection",
            InfraKind::Timeout => "timeout",
            InfraKind::Codec => "codec",
            InfraKind::Backend => "backend",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed on {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("business rule violated [{code}]: {message}")]
    BusinessRule { code: RuleCode, message: String },

    #[error("concurrency conflict on {entity} {id}: expected version {expected_version}")]
    Concurrency {
        entity: &'static str,
        id: String,
        expected_version: i64,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("infrastructure error ({kind}): {message}")]
    Infrastructure { kind: InfraKind, message: String },
}

impl LedgerError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn rule(code: RuleCode, message: impl Into<String>) -> Self {
        LedgerError::BusinessRule {
            code,
            message: message.into(),
        }
    }

    pub fn concurrency(entity: &'static str, id: impl fmt::Display, expected_version: i64) -> Self {
        LedgerError::Concurrency {
            entity,
            id: id.to_string(),
            expected_version,
        }
    }

    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn duplicate(entity: &'static str, key: impl fmt::Display) -> Self {
        LedgerError::Duplicate {
            entity,
            key: key.to_string(),
        }
    }

    pub fn infrastructure(kind: InfraKind, message: impl Into<String>) -> Self {
        LedgerError::Infrastructure {
            kind,
            message: message.into(),
        }
    }

    /// Only infrastructure faults classified as transient qualify for an automatic retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Infrastructure { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, LedgerError::Concurrency { .. })
    }

    pub fn rule_code(&self) -> Option<RuleCode> {
        match self {
            LedgerError::BusinessRule { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::infrastructure(InfraKind::Codec, err.to_string())
    }
}
