use crate::modules::wallets::core::wallet::Wallet;
use crate::shared::core::errors::LedgerError;
use crate::shared::core::primitives::Money;
use serde::Deserialize;

/// One balance or lifecycle operation on an existing wallet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalletCommand {
    Credit { amount: Money },
    Debit { amount: Money },
    Reserve { amount: Money },
    Release { amount: Money },
    CompletePending { amount: Money },
    Suspend,
    Activate,
    Lock,
    Close,
    UpdateLimits { daily: Money, monthly: Money },
}

impl WalletCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WalletCommand::Credit { .. } => "credit",
            WalletCommand::Debit { .. } => "debit",
            WalletCommand::Reserve { .. } => "reserve",
            WalletCommand::Release { .. } => "release",
            WalletCommand::CompletePending { .. } => "complete_pending",
            WalletCommand::Suspend => "suspend",
            WalletCommand::Activate => "activate",
            WalletCommand::Lock => "lock",
            WalletCommand::Close => "close",
            WalletCommand::UpdateLimits { .. } => "update_limits",
        }
    }

    pub fn apply_to(&self, wallet: &mut Wallet) -> Result<(), LedgerError> {
        match self {
            WalletCommand::Credit { amount } => wallet.credit(amount),
            WalletCommand::Debit { amount } => wallet.debit(amount),
            WalletCommand::Reserve { amount } => wallet.reserve(amount),
            WalletCommand::Release { amount } => wallet.release(amount),
            WalletCommand::CompletePending { amount } => wallet.complete_pending(amount),
            WalletCommand::Suspend => wallet.suspend(),
            WalletCommand::Activate => wallet.activate(),
            WalletCommand::Lock => wallet.lock(),
            WalletCommand::Close => wallet.close(),
            WalletCommand::UpdateLimits { daily, monthly } => {
                wallet.update_limits(daily.clone(), monthly.clone())
            }
        }
    }
}
