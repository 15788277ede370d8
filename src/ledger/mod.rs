//! Credit ledger: balance-sheet invariants and the append-only usage journal

pub mod balance;
pub mod model;
pub mod service;

pub use balance::Balances;
pub use model::{AdjustRequestInput, LimitSnapshot, UsageRequest};
pub use service::CreditLedgerService;
