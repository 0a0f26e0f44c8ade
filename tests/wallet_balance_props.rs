// Property tests for the wallet balance invariants.
//
// Responsibilities
// - Drive arbitrary operation sequences through the aggregate and check after every step that no
//   balance goes negative, money is conserved, and the version moves exactly once per accepted change.

use ledger_core::modules::wallets::core::wallet::{Wallet, WalletType};
use ledger_core::modules::wallets::use_cases::apply_wallet_command::command::WalletCommand;
use ledger_core::shared::core::primitives::{Currency, Money};
use proptest::prelude::*;
use uuid::Uuid;

fn usd(amount: i64) -> Money {
    Money::positive(amount, Currency::new("USD").unwrap()).unwrap()
}

fn command() -> impl Strategy<Value = WalletCommand> {
    prop_oneof![
        4 => (1i64..500).prop_map(|a| WalletCommand::Credit { amount: usd(a) }),
        3 => (1i64..500).prop_map(|a| WalletCommand::Debit { amount: usd(a) }),
        3 => (1i64..500).prop_map(|a| WalletCommand::Reserve { amount: usd(a) }),
        2 => (1i64..500).prop_map(|a| WalletCommand::Release { amount: usd(a) }),
        2 => (1i64..500).prop_map(|a| WalletCommand::CompletePending { amount: usd(a) }),
        1 => Just(WalletCommand::Suspend),
        1 => Just(WalletCommand::Activate),
        1 => Just(WalletCommand::Lock),
    ]
}

proptest! {
    #[test]
    fn it_should_keep_balances_non_negative_and_conserved(commands in prop::collection::vec(command(), 1..60)) {
        let currency = Currency::new("USD").unwrap();
        let mut wallet = Wallet::open(
            Uuid::now_v7(),
            currency.clone(),
            WalletType::Fiat,
            Money::new(1_000, currency.clone()).unwrap(),
            Money::new(10_000, currency).unwrap(),
        )
        .unwrap();
        let mut inflow = 0i64;
        let mut outflow = 0i64;

        for command in commands {
            let before = wallet.version();
            let accepted = command.apply_to(&mut wallet).is_ok();
            if accepted {
                match &command {
                    WalletCommand::Credit { amount } => inflow += amount.amount(),
                    WalletCommand::Debit { amount } | WalletCommand::CompletePending { amount } => {
                        outflow += amount.amount()
                    }
                    _ => {}
                }
            }

            prop_assert!(wallet.available().amount() >= 0);
            prop_assert!(wallet.pending().amount() >= 0);
            prop_assert_eq!(
                wallet.available().amount() + wallet.pending().amount(),
                inflow - outflow
            );
            prop_assert_eq!(wallet.version(), before + i64::from(accepted));
        }
    }
}
