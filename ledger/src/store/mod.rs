//! Ledger storage.
//!
//! A [`LedgerStore`] holds sellers, credits, the append-only transaction log,
//! sales and deposit requests. Every balance mutation goes through a
//! [`UnitOfWork`]: writes are staged inside the unit and become visible only
//! on [`UnitOfWork::commit`]. Dropping a unit without committing rolls it back
//! and releases every lock it holds.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use sellercredit_common::{
    CreditId, DepositId, Result, SaleId, SellerId, UserId,
};

use crate::credit::Credit;
use crate::deposit::DepositRequest;
use crate::sale::Sale;
use crate::seller::Seller;
use crate::transaction_log::{LogTotals, LogType, TransactionLog};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryLedgerStore, MemoryUnit};
pub use postgres::{PgLedgerStore, PgUnit};

/// Limit/offset window for list reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum rows to return.
    pub limit: usize,
    /// Rows to skip.
    pub offset: usize,
}

impl Page {
    /// Create a page window.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    /// First page of the given size.
    pub fn first(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }

    /// Clamp the limit to a maximum page size.
    pub fn clamped(self, max_limit: usize) -> Self {
        Self {
            limit: self.limit.min(max_limit),
            offset: self.offset,
        }
    }

    /// Apply the window to an iterator.
    pub fn slice<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(50)
    }
}

/// An all-or-nothing group of storage operations.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock a seller's credit until this unit ends and return its current state.
    ///
    /// Blocks behind other units holding the same seller; never behind
    /// units for other sellers. Fails with `NotFound` when the seller has no
    /// credit and with `ConflictTimeout` when the lock wait is exceeded.
    async fn get_for_update(&mut self, seller_id: SellerId) -> Result<Credit>;

    /// Stage a new balance. The credit must be locked by this unit.
    async fn save(&mut self, credit: &Credit) -> Result<()>;

    /// Stage an immutable log entry for a credit locked by this unit.
    async fn append_log(
        &mut self,
        credit_id: CreditId,
        amount: Decimal,
        log_type: LogType,
    ) -> Result<TransactionLog>;

    /// Stage a sale for a seller locked by this unit.
    async fn insert_sale(&mut self, sale: Sale) -> Result<Sale>;

    /// Re-read a deposit request inside this unit.
    ///
    /// Callers lock the owning seller's credit first; deposit transitions
    /// are serialized by that lock.
    async fn deposit_for_update(&mut self, deposit_id: DepositId) -> Result<DepositRequest>;

    /// Stage a deposit status change. The owning seller must be locked.
    async fn save_deposit(&mut self, deposit: &DepositRequest) -> Result<()>;

    /// Make every staged write visible at once and release locks.
    async fn commit(self) -> Result<()>;

    /// Discard staged writes and release locks.
    async fn rollback(self) -> Result<()>;
}

/// Durable storage for the seller-credit ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Unit-of-work type produced by [`LedgerStore::begin`].
    type Unit: UnitOfWork + 'static;

    /// Open a unit of work.
    async fn begin(&self) -> Result<Self::Unit>;

    /// Create a seller together with its zero-balance credit.
    async fn create_seller(&self, seller: Seller) -> Result<(Seller, Credit)>;

    /// Persist a seller's names and `updated_at`. Ids and the user link are fixed.
    async fn update_seller(&self, seller: Seller) -> Result<Seller>;

    /// Look up a seller.
    async fn seller(&self, seller_id: SellerId) -> Result<Seller>;

    /// Look up the seller linked to a user.
    async fn seller_for_user(&self, user_id: UserId) -> Result<Seller>;

    /// Committed credit for a seller; may be stale relative to in-flight units.
    async fn credit_for_seller(&self, seller_id: SellerId) -> Result<Credit>;

    /// Sum of log amounts of one type for a credit.
    async fn sum_by_type(&self, credit_id: CreditId, log_type: LogType) -> Result<Decimal>;

    /// Deposit and sale totals for a credit in one read.
    async fn log_totals(&self, credit_id: CreditId) -> Result<LogTotals>;

    /// Log entries for a credit in id order.
    async fn logs_for_credit(&self, credit_id: CreditId, page: Page)
        -> Result<Vec<TransactionLog>>;

    /// Look up a sale.
    async fn sale(&self, sale_id: SaleId) -> Result<Sale>;

    /// Sales for a seller, oldest first.
    async fn sales_for_seller(&self, seller_id: SellerId, page: Page) -> Result<Vec<Sale>>;

    /// Store a new pending deposit request.
    async fn insert_deposit(&self, deposit: DepositRequest) -> Result<DepositRequest>;

    /// Look up a deposit request.
    async fn deposit(&self, deposit_id: DepositId) -> Result<DepositRequest>;

    /// Deposit requests for a seller, oldest first.
    async fn deposits_for_seller(
        &self,
        seller_id: SellerId,
        page: Page,
    ) -> Result<Vec<DepositRequest>>;

    /// Sum of APPROVED deposit request amounts for a credit.
    async fn approved_deposit_total(&self, credit_id: CreditId) -> Result<Decimal>;

    /// Drop per-seller bookkeeping that no unit is using.
    fn cleanup_idle(&self) {}
}

/// Commit a unit when `result` is `Ok`, roll it back otherwise.
///
/// A failed rollback is logged; the original error is returned.
pub async fn finish_unit<U: UnitOfWork, T>(unit: U, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            unit.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = unit.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
