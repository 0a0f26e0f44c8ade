// Shared transaction fixtures for unit tests.

use crate::modules::transactions::core::transaction::{NewTransaction, TransactionType};
use crate::test_support::fixtures::wallets::usd_amount;
use std::collections::BTreeMap;
use uuid::Uuid;

pub struct NewTransactionBuilder {
    inner: NewTransaction,
}

impl Default for NewTransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl NewTransactionBuilder {
    pub fn new() -> Self {
        Self {
            inner: NewTransaction {
                wallet_id: Uuid::now_v7(),
                idempotency_key: format!("idem-{}", Uuid::now_v7()),
                transaction_type: TransactionType::Deposit,
                amount: usd_amount(100),
                description: "fixture transaction".to_string(),
                external_reference: None,
                metadata: BTreeMap::new(),
            },
        }
    }

    pub fn wallet_id(mut self, v: Uuid) -> Self {
        self.inner.wallet_id = v;
        self
    }

    pub fn idempotency_key(mut self, v: impl Into<String>) -> Self {
        self.inner.idempotency_key = v.into();
        self
    }

    pub fn transaction_type(mut self, v: TransactionType) -> Self {
        self.inner.transaction_type = v;
        self
    }

    pub fn amount(mut self, v: i64) -> Self {
        self.inner.amount = usd_amount(v);
        self
    }

    pub fn description(mut self, v: impl Into<String>) -> Self {
        self.inner.description = v.into();
        self
    }

    pub fn external_reference(mut self, v: impl Into<String>) -> Self {
        self.inner.external_reference = Some(v.into());
        self
    }

    pub fn build(self) -> NewTransaction {
        self.inner
    }
}
