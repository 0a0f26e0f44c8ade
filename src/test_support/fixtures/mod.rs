pub mod transactions;
pub mod wallets;
