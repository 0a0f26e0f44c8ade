// Transaction event payloads, one per state machine transition.

use crate::modules::transactions::core::transaction::TransactionType;
use crate::shared::core::domain_event::EventPayload;
use crate::shared::core::primitives::Money;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransactionEvent {
    TransactionCreated {
        wallet_id: Uuid,
        idempotency_key: String,
        transaction_type: TransactionType,
        amount: Money,
    },
    TransactionProcessing {
        version: i64,
    },
    TransactionCompleted {
        version: i64,
    },
    TransactionFailed {
        reason: String,
        version: i64,
    },
    TransactionCancelled {
        version: i64,
    },
    TransactionRetried {
        retry_count: u32,
        version: i64,
    },
}

impl EventPayload for TransactionEvent {
    const AGGREGATE_TYPE: &'static str = "transaction";

    fn event_type(&self) -> &'static str {
        match self {
            TransactionEvent::TransactionCreated { .. } => "TransactionCreated",
            TransactionEvent::TransactionProcessing { .. } => "TransactionProcessing",
            TransactionEvent::TransactionCompleted { .. } => "TransactionCompleted",
            TransactionEvent::TransactionFailed { .. } => "TransactionFailed",
            TransactionEvent::TransactionCancelled { .. } => "TransactionCancelled",
            TransactionEvent::TransactionRetried { .. } => "TransactionRetried",
        }
    }
}
