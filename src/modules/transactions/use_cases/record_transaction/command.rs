use crate::modules::transactions::core::transaction::{NewTransaction, Transaction, TransactionType};
use crate::shared::core::primitives::Money;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordTransaction {
    pub wallet_id: Uuid,
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub amount: Money,
    /// Required for, and only accepted on, TRANSFER.
    #[serde(default)]
    pub destination_wallet_id: Option<Uuid>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RecordTransaction {
    pub fn to_new_transaction(&self) -> NewTransaction {
        NewTransaction {
            wallet_id: self.wallet_id,
            idempotency_key: self.idempotency_key.clone(),
            transaction_type: self.transaction_type,
            amount: self.amount.clone(),
            description: self.description.clone(),
            external_reference: self.external_reference.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// `created` is false when the idempotency key resolved to a transaction recorded earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub transaction: Transaction,
    pub created: bool,
}
