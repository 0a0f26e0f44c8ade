// Value types shared by every ledger module.
//
// Purpose
// - Represent amounts as integer minor units bound to a currency code.
//
// Responsibilities
// - Reject negative amounts at construction. Arithmetic never mixes currencies and never overflows silently.
//
// Boundaries
// - No input or output. Values are immutable; every operation returns a new value.

use crate::shared::core::errors::{LedgerError, RuleCode};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl AsRef<str>) -> Result<Self, LedgerError> {
        let code = code.as_ref().trim();
        let well_formed = (3..=10).contains(&code.len())
            && code.starts_with(|c: char| c.is_ascii_uppercase())
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if !well_formed {
            return Err(LedgerError::validation(
                "currency",
                format!("'{code}' is not an uppercase currency code of 3 to 10 characters"),
            ));
        }
        Ok(Self(code.to_string()))
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Currency {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

/// A non-negative amount in minor units (cents, satoshi, ...) of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "MoneyRepr")]
pub struct Money {
    amount: i64,
    currency: Currency,
}

#[derive(Deserialize)]
struct MoneyRepr {
    amount: i64,
    currency: Currency,
}

impl TryFrom<MoneyRepr> for Money {
    type Error = LedgerError;

    fn try_from(value: MoneyRepr) -> Result<Self, Self::Error> {
        Money::new(value.amount, value.currency)
    }
}

impl Money {
    pub fn new(amount: i64, currency: Currency) -> Result<Self, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::validation(
                "amount",
                format!("amount must not be negative, got {amount}"),
            ));
        }
        Ok(Self { amount, currency })
    }

    /// Strictly positive amounts, as required for transaction amounts.
    pub fn positive(amount: i64, currency: Currency) -> Result<Self, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::validation(
                "amount",
                format!("amount must be greater than zero, got {amount}"),
            ));
        }
        Ok(Self { amount, currency })
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: 0,
            currency,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn ensure_currency(&self, expected: &Currency) -> Result<(), LedgerError> {
        if &self.currency != expected {
            return Err(LedgerError::rule(
                RuleCode::CurrencyMismatch,
                format!("expected {expected}, got {}", self.currency),
            ));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, LedgerError> {
        other.ensure_currency(&self.currency)?;
        let amount = self.amount.checked_add(other.amount).ok_or_else(|| {
            LedgerError::validation("amount", format!("{self} + {other} overflows"))
        })?;
        Ok(Money {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Fails with a validation error when the result would be negative; callers that need a coded
    /// rejection (insufficient balance) compare before subtracting.
    pub fn checked_sub(&self, other: &Money) -> Result<Money, LedgerError> {
        other.ensure_currency(&self.currency)?;
        if other.amount > self.amount {
            return Err(LedgerError::validation(
                "amount",
                format!("{self} - {other} would be negative"),
            ));
        }
        Ok(Money {
            amount: self.amount - other.amount,
            currency: self.currency.clone(),
        })
    }

    pub fn covers(&self, other: &Money) -> Result<bool, LedgerError> {
        other.ensure_currency(&self.currency)?;
        Ok(self.amount >= other.amount)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod money_tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    #[rstest]
    #[case("USD")]
    #[case("USDT")]
    #[case("BTC")]
    #[case("A1B2C3")]
    fn it_should_accept_well_formed_currency_codes(#[case] code: &str) {
        assert_eq!(Currency::new(code).unwrap().code(), code);
    }

    #[rstest]
    #[case("usd")]
    #[case("US")]
    #[case("1USD")]
    #[case("TOOLONGCODE1")]
    #[case("US D")]
    fn it_should_reject_malformed_currency_codes(#[case] code: &str) {
        assert!(matches!(
            Currency::new(code),
            Err(LedgerError::Validation { field: "currency", .. })
        ));
    }

    #[rstest]
    fn it_should_reject_negative_amounts(usd: Currency) {
        assert!(Money::new(-1, usd.clone()).is_err());
        assert!(Money::new(0, usd).unwrap().is_zero());
    }

    #[rstest]
    fn it_should_require_positive_amounts_for_positive_constructor(usd: Currency) {
        assert!(Money::positive(0, usd.clone()).is_err());
        assert_eq!(Money::positive(1, usd).unwrap().amount(), 1);
    }

    #[rstest]
    fn it_should_add_and_subtract_in_the_same_currency(usd: Currency) {
        let a = Money::new(100, usd.clone()).unwrap();
        let b = Money::new(30, usd).unwrap();
        assert_eq!(a.checked_add(&b).unwrap().amount(), 130);
        assert_eq!(a.checked_sub(&b).unwrap().amount(), 70);
        assert!(b.checked_sub(&a).is_err());
    }

    #[rstest]
    fn it_should_refuse_to_mix_currencies(usd: Currency) {
        let a = Money::new(100, usd).unwrap();
        let b = Money::new(100, Currency::new("EUR").unwrap()).unwrap();
        let err = a.checked_add(&b).unwrap_err();
        assert_eq!(err.rule_code(), Some(RuleCode::CurrencyMismatch));
        assert!(a.covers(&b).is_err());
    }

    #[rstest]
    fn it_should_report_overflow_as_a_validation_error(usd: Currency) {
        let max = Money::new(i64::MAX, usd.clone()).unwrap();
        let one = Money::new(1, usd).unwrap();
        assert!(matches!(
            max.checked_add(&one),
            Err(LedgerError::Validation { .. })
        ));
    }

    #[rstest]
    fn it_should_round_trip_currency_through_json(usd: Currency) {
        let money = Money::new(250, usd).unwrap();
        let json = serde_json::to_value(&money).unwrap();
        assert_eq!(json, serde_json::json!({ "amount": 250, "currency": "USD" }));
        assert_eq!(serde_json::from_value::<Money>(json).unwrap(), money);
        let malformed = serde_json::json!({ "amount": 1, "currency": "usd" });
        assert!(serde_json::from_value::<Money>(malformed).is_err());
        let negative = serde_json::json!({ "amount": -1, "currency": "USD" });
        assert!(serde_json::from_value::<Money>(negative).is_err());
    }
}
