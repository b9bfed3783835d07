//! Seller credit ledger.
//!
//! Per-seller prepaid balances with an append-only transaction log. Every
//! balance change goes through [`BalanceMutator`], which serializes
//! mutations per seller and commits the balance and its log entry together.

pub mod config;
pub mod credit;
pub mod deposit;
pub mod lock_table;
pub mod mutator;
pub mod sale;
pub mod seller;
pub mod store;
pub mod transaction_log;
pub mod validators;
pub mod views;

pub use config::LedgerConfig;
pub use credit::Credit;
pub use deposit::{DepositRequest, DepositStatus};
pub use lock_table::{CreditLock, LockStats, LockTable};
pub use mutator::{AppliedDelta, BalanceMutator};
pub use sale::Sale;
pub use seller::Seller;
pub use store::{finish_unit, LedgerStore, MemoryLedgerStore, Page, PgLedgerStore, UnitOfWork};
pub use transaction_log::{LogTotals, LogType, TransactionLog};
pub use validators::DenominationSet;
pub use views::{LedgerSummary, LedgerViews};
