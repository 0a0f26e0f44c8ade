// Shared wallet fixtures for unit tests.

use crate::modules::wallets::core::wallet::{Wallet, WalletType};
use crate::shared::core::primitives::{Currency, Money};
use uuid::Uuid;

pub fn usd() -> Currency {
    Currency::new("USD").unwrap()
}

pub fn usd_amount(amount: i64) -> Money {
    Money::new(amount, usd()).unwrap()
}

pub struct WalletBuilder {
    owner_id: Uuid,
    currency: Currency,
    wallet_type: WalletType,
    daily_limit: i64,
    monthly_limit: i64,
}

impl Default for WalletBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl WalletBuilder {
    pub fn new() -> Self {
        Self {
            owner_id: Uuid::now_v7(),
            currency: usd(),
            wallet_type: WalletType::Fiat,
            daily_limit: 10_000,
            monthly_limit: 100_000,
        }
    }

    pub fn owner_id(mut self, v: Uuid) -> Self {
        self.owner_id = v;
        self
    }

    pub fn currency(mut self, code: &str) -> Self {
        self.currency = Currency::new(code).unwrap();
        self
    }

    pub fn wallet_type(mut self, v: WalletType) -> Self {
        self.wallet_type = v;
        self
    }

    pub fn limits(mut self, daily: i64, monthly: i64) -> Self {
        self.daily_limit = daily;
        self.monthly_limit = monthly;
        self
    }

    pub fn build(self) -> Wallet {
        Wallet::open(
            self.owner_id,
            self.currency.clone(),
            self.wallet_type,
            Money::new(self.daily_limit, self.currency.clone()).unwrap(),
            Money::new(self.monthly_limit, self.currency).unwrap(),
        )
        .unwrap()
    }
}
