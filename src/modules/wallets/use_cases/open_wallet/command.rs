use crate::modules::wallets::core::wallet::WalletType;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenWallet {
    pub owner_id: Uuid,
    pub currency: String,
    pub wallet_type: WalletType,
    /// Minor units; the configured default applies when absent.
    pub daily_limit: Option<i64>,
    pub monthly_limit: Option<i64>,
}

/// Limits given to a wallet whose opening command does not name its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultLimits {
    pub daily: i64,
    pub monthly: i64,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            daily: 1_000_000,
            monthly: 10_000_000,
        }
    }
}
