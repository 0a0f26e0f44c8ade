// Wallet event payloads.
//
// Purpose
// - One variant per successful wallet transition, carrying the balances after the change so consumers
//   never need to replay to know the current figures.
//
// Versioning and evolution
// - Add fields, never change the meaning of existing ones. Breaking changes get a new variant.

use crate::modules::wallets::core::wallet::WalletType;
use crate::shared::core::domain_event::EventPayload;
use crate::shared::core::primitives::{Currency, Money};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMovement {
    pub amount: Money,
    pub available: Money,
    pub pending: Money,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WalletEvent {
    WalletOpened {
        owner_id: Uuid,
        currency: Currency,
        wallet_type: WalletType,
    },
    WalletCredited(BalanceMovement),
    WalletDebited(BalanceMovement),
    FundsReserved(BalanceMovement),
    FundsReleased(BalanceMovement),
    PendingCompleted(BalanceMovement),
    WalletSuspended {
        version: i64,
    },
    WalletActivated {
        version: i64,
    },
    WalletLocked {
        version: i64,
    },
    WalletClosed {
        version: i64,
    },
    WalletLimitsUpdated {
        daily_limit: Money,
        monthly_limit: Money,
        version: i64,
    },
}

impl EventPayload for WalletEvent {
    const AGGREGATE_TYPE: &'static str = "wallet";

    fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::WalletOpened { .. } => "WalletOpened",
            WalletEvent::WalletCredited(_) => "WalletCredited",
            WalletEvent::WalletDebited(_) => "WalletDebited",
            WalletEvent::FundsReserved(_) => "FundsReserved",
            WalletEvent::FundsReleased(_) => "FundsReleased",
            WalletEvent::PendingCompleted(_) => "PendingCompleted",
            WalletEvent::WalletSuspended { .. } => "WalletSuspended",
            WalletEvent::WalletActivated { .. } => "WalletActivated",
            WalletEvent::WalletLocked { .. } => "WalletLocked",
            WalletEvent::WalletClosed { .. } => "WalletClosed",
            WalletEvent::WalletLimitsUpdated { .. } => "WalletLimitsUpdated",
        }
    }
}
