//! In-process ledger store.
//!
//! Committed state lives behind one `RwLock`. Units of work stage their
//! writes privately and apply them under a single write guard at commit, so a
//! reader sees either none or all of a unit's effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use sellercredit_common::{
    CreditError, CreditId, DepositId, LogId, Result, SaleId, SellerId, UserId,
};

use crate::config::LedgerConfig;
use crate::credit::Credit;
use crate::deposit::{DepositRequest, DepositStatus};
use crate::lock_table::{CreditLock, LockStats, LockTable};
use crate::sale::Sale;
use crate::seller::Seller;
use crate::store::{LedgerStore, Page, UnitOfWork};
use crate::transaction_log::{LogTotals, LogType, TransactionLog};

#[derive(Default)]
struct MemoryState {
    sellers: HashMap<SellerId, Seller>,
    sellers_by_user: HashMap<UserId, SellerId>,
    credits: HashMap<SellerId, Credit>,
    seller_by_credit: HashMap<CreditId, SellerId>,
    logs: Vec<TransactionLog>,
    sales: HashMap<SaleId, Sale>,
    deposits: HashMap<DepositId, DepositRequest>,
}

/// In-memory [`LedgerStore`] with per-seller locking.
#[derive(Clone)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
    locks: Arc<LockTable>,
    next_log_id: Arc<AtomicI64>,
    fail_next_commit: Arc<AtomicBool>,
    commit_delay: Arc<Mutex<Option<Duration>>>,
}

impl MemoryLedgerStore {
    /// Create an empty store.
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            locks: Arc::new(LockTable::new(config.lock_timeout)),
            next_log_id: Arc::new(AtomicI64::new(1)),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
            commit_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Make the next commit fail with `StorageFailure`.
    ///
    /// Used to exercise rollback paths.
    pub fn inject_commit_failure(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next commit stall for `delay` before applying its writes.
    pub fn inject_commit_delay(&self, delay: Duration) {
        *self.commit_delay.lock() = Some(delay);
    }

    /// Lock table statistics.
    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    /// Check whether a seller's credit is locked by some unit.
    pub fn is_locked(&self, seller_id: &SellerId) -> bool {
        self.locks.is_locked(seller_id)
    }

    /// Every committed log entry, in id order.
    ///
    /// Entries are stored in commit order; ids are reserved earlier, so
    /// units for different sellers can commit out of id order.
    pub fn all_logs(&self) -> Vec<TransactionLog> {
        let mut logs = self.state.read().logs.clone();
        logs.sort_by_key(|entry| entry.id);
        logs
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new(&LedgerConfig::default())
    }
}

/// Unit of work over a [`MemoryLedgerStore`].
pub struct MemoryUnit {
    store: MemoryLedgerStore,
    held: HashMap<SellerId, CreditLock>,
    credits: HashMap<SellerId, Credit>,
    logs: Vec<TransactionLog>,
    sales: Vec<Sale>,
    deposits: HashMap<DepositId, DepositRequest>,
}

impl MemoryUnit {
    fn new(store: MemoryLedgerStore) -> Self {
        Self {
            store,
            held: HashMap::new(),
            credits: HashMap::new(),
            logs: Vec::new(),
            sales: Vec::new(),
            deposits: HashMap::new(),
        }
    }

    fn require_lock(&self, seller_id: SellerId, operation: &str) -> Result<()> {
        if self.held.contains_key(&seller_id) {
            Ok(())
        } else {
            Err(CreditError::StorageFailure(format!(
                "{operation} without holding the credit lock for seller {seller_id}"
            )))
        }
    }

    fn locked_seller_for_credit(&self, credit_id: CreditId) -> Option<SellerId> {
        self.credits
            .values()
            .find(|credit| credit.id == credit_id)
            .map(|credit| credit.seller_id)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    #[instrument(skip(self))]
    async fn get_for_update(&mut self, seller_id: SellerId) -> Result<Credit> {
        if let Some(credit) = self.credits.get(&seller_id) {
            return Ok(credit.clone());
        }

        let lock = self.store.locks.acquire(seller_id).await?;
        let credit = self
            .store
            .state
            .read()
            .credits
            .get(&seller_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found("credit", seller_id))?;

        self.held.insert(seller_id, lock);
        self.credits.insert(seller_id, credit.clone());
        Ok(credit)
    }

    async fn save(&mut self, credit: &Credit) -> Result<()> {
        self.require_lock(credit.seller_id, "save")?;
        if credit.balance.is_sign_negative() && !credit.balance.is_zero() {
            return Err(CreditError::StorageFailure(format!(
                "refusing to store negative balance {} for credit {}",
                credit.balance, credit.id
            )));
        }

        self.credits.insert(credit.seller_id, credit.clone());
        Ok(())
    }

    async fn append_log(
        &mut self,
        credit_id: CreditId,
        amount: Decimal,
        log_type: LogType,
    ) -> Result<TransactionLog> {
        if self.locked_seller_for_credit(credit_id).is_none() {
            return Err(CreditError::StorageFailure(format!(
                "append_log for credit {credit_id} outside its lock"
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(CreditError::invalid_amount(
                amount,
                "log amounts must be positive",
            ));
        }

        let entry = TransactionLog {
            id: LogId::new(self.store.next_log_id.fetch_add(1, Ordering::SeqCst)),
            credit_id,
            amount,
            log_type,
            created_at: Utc::now(),
        };
        self.logs.push(entry.clone());
        Ok(entry)
    }

    async fn insert_sale(&mut self, sale: Sale) -> Result<Sale> {
        self.require_lock(sale.seller_id, "insert_sale")?;
        self.sales.push(sale.clone());
        Ok(sale)
    }

    async fn deposit_for_update(&mut self, deposit_id: DepositId) -> Result<DepositRequest> {
        if let Some(deposit) = self.deposits.get(&deposit_id) {
            return Ok(deposit.clone());
        }

        let deposit = self
            .store
            .state
            .read()
            .deposits
            .get(&deposit_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found("deposit request", deposit_id))?;

        self.require_lock(deposit.seller_id, "deposit_for_update")?;
        self.deposits.insert(deposit_id, deposit.clone());
        Ok(deposit)
    }

    async fn save_deposit(&mut self, deposit: &DepositRequest) -> Result<()> {
        self.require_lock(deposit.seller_id, "save_deposit")?;
        self.deposits.insert(deposit.id, deposit.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn commit(self) -> Result<()> {
        let delay = self.store.commit_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.store.fail_next_commit.swap(false, Ordering::SeqCst) {
            warn!("Injected commit failure; rolling back unit");
            return Err(CreditError::StorageFailure(
                "injected commit failure".to_string(),
            ));
        }

        let MemoryUnit {
            store,
            held,
            credits,
            logs,
            sales,
            deposits,
        } = self;

        {
            let mut state = store.state.write();

            if let Some(missing) = credits
                .keys()
                .find(|seller_id| !state.credits.contains_key(*seller_id))
            {
                return Err(CreditError::not_found("credit", missing));
            }

            for (seller_id, credit) in credits {
                state.credits.insert(seller_id, credit);
            }
            state.logs.extend(logs);
            for sale in sales {
                state.sales.insert(sale.id, sale);
            }
            for (deposit_id, deposit) in deposits {
                state.deposits.insert(deposit_id, deposit);
            }
        }

        debug!(locks = held.len(), "Unit committed");
        drop(held);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        debug!(
            locks = self.held.len(),
            staged_logs = self.logs.len(),
            "Unit rolled back"
        );
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit> {
        Ok(MemoryUnit::new(self.clone()))
    }

    async fn create_seller(&self, seller: Seller) -> Result<(Seller, Credit)> {
        let credit = Credit::zero(seller.id);
        let mut state = self.state.write();

        if state.sellers_by_user.contains_key(&seller.user_id) {
            return Err(CreditError::invalid_field(
                "user",
                format!("user {} already has a seller", seller.user_id),
            ));
        }

        state.sellers_by_user.insert(seller.user_id, seller.id);
        state.seller_by_credit.insert(credit.id, seller.id);
        state.sellers.insert(seller.id, seller.clone());
        state.credits.insert(seller.id, credit.clone());

        Ok((seller, credit))
    }

    async fn update_seller(&self, seller: Seller) -> Result<Seller> {
        let mut state = self.state.write();
        match state.sellers.get_mut(&seller.id) {
            Some(stored) => {
                stored.first_name = seller.first_name.clone();
                stored.last_name = seller.last_name.clone();
                stored.updated_at = seller.updated_at;
                Ok(stored.clone())
            }
            None => Err(CreditError::not_found("seller", seller.id)),
        }
    }

    async fn seller(&self, seller_id: SellerId) -> Result<Seller> {
        self.state
            .read()
            .sellers
            .get(&seller_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found("seller", seller_id))
    }

    async fn seller_for_user(&self, user_id: UserId) -> Result<Seller> {
        let state = self.state.read();
        state
            .sellers_by_user
            .get(&user_id)
            .and_then(|seller_id| state.sellers.get(seller_id))
            .cloned()
            .ok_or_else(|| CreditError::not_found("seller for user", user_id))
    }

    async fn credit_for_seller(&self, seller_id: SellerId) -> Result<Credit> {
        self.state
            .read()
            .credits
            .get(&seller_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found("credit", seller_id))
    }

    async fn sum_by_type(&self, credit_id: CreditId, log_type: LogType) -> Result<Decimal> {
        Ok(self
            .state
            .read()
            .logs
            .iter()
            .filter(|entry| entry.credit_id == credit_id && entry.log_type == log_type)
            .map(|entry| entry.amount)
            .sum())
    }

    async fn log_totals(&self, credit_id: CreditId) -> Result<LogTotals> {
        Ok(self
            .state
            .read()
            .logs
            .iter()
            .filter(|entry| entry.credit_id == credit_id)
            .collect())
    }

    async fn logs_for_credit(
        &self,
        credit_id: CreditId,
        page: Page,
    ) -> Result<Vec<TransactionLog>> {
        let state = self.state.read();
        if !state.seller_by_credit.contains_key(&credit_id) {
            return Err(CreditError::not_found("credit", credit_id));
        }

        Ok(page.slice(
            state
                .logs
                .iter()
                .filter(|entry| entry.credit_id == credit_id)
                .cloned(),
        ))
    }

    async fn sale(&self, sale_id: SaleId) -> Result<Sale> {
        self.state
            .read()
            .sales
            .get(&sale_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found("sale", sale_id))
    }

    async fn sales_for_seller(&self, seller_id: SellerId, page: Page) -> Result<Vec<Sale>> {
        let mut sales: Vec<Sale> = self
            .state
            .read()
            .sales
            .values()
            .filter(|sale| sale.seller_id == seller_id)
            .cloned()
            .collect();
        sales.sort_by_key(|sale| (sale.created_at, sale.id));
        Ok(page.slice(sales))
    }

    async fn insert_deposit(&self, deposit: DepositRequest) -> Result<DepositRequest> {
        let mut state = self.state.write();
        if !state.credits.contains_key(&deposit.seller_id) {
            return Err(CreditError::not_found("credit", deposit.seller_id));
        }
        state.deposits.insert(deposit.id, deposit.clone());
        Ok(deposit)
    }

    async fn deposit(&self, deposit_id: DepositId) -> Result<DepositRequest> {
        self.state
            .read()
            .deposits
            .get(&deposit_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found("deposit request", deposit_id))
    }

    async fn deposits_for_seller(
        &self,
        seller_id: SellerId,
        page: Page,
    ) -> Result<Vec<DepositRequest>> {
        let mut deposits: Vec<DepositRequest> = self
            .state
            .read()
            .deposits
            .values()
            .filter(|deposit| deposit.seller_id == seller_id)
            .cloned()
            .collect();
        deposits.sort_by_key(|deposit| (deposit.created_at, deposit.id));
        Ok(page.slice(deposits))
    }

    async fn approved_deposit_total(&self, credit_id: CreditId) -> Result<Decimal> {
        Ok(self
            .state
            .read()
            .deposits
            .values()
            .filter(|deposit| {
                deposit.credit_id == credit_id && deposit.status == DepositStatus::Approved
            })
            .map(|deposit| deposit.amount)
            .sum())
    }

    fn cleanup_idle(&self) {
        self.locks.cleanup_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn store_with_seller() -> (MemoryLedgerStore, Seller, Credit) {
        let store = MemoryLedgerStore::default();
        let (seller, credit) = store
            .create_seller(Seller::new(UserId::new(), None, None))
            .await
            .unwrap();
        (store, seller, credit)
    }

    #[tokio::test]
    async fn test_create_seller_creates_zero_credit() {
        let (store, seller, credit) = store_with_seller().await;

        let stored = store.credit_for_seller(seller.id).await.unwrap();
        assert_eq!(stored, credit);
        assert_eq!(stored.balance, Decimal::ZERO);
        assert_eq!(store.seller_for_user(seller.user_id).await.unwrap(), seller);
    }

    #[tokio::test]
    async fn test_one_seller_per_user() {
        let (store, seller, _) = store_with_seller().await;

        let err = store
            .create_seller(Seller::new(seller.user_id, None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let (store, seller, _) = store_with_seller().await;

        let mut unit = store.begin().await.unwrap();
        let mut credit = unit.get_for_update(seller.id).await.unwrap();
        credit.apply(dec!(1000)).unwrap();
        unit.save(&credit).await.unwrap();
        unit.append_log(credit.id, dec!(1000), LogType::Deposit)
            .await
            .unwrap();

        assert_eq!(
            store.credit_for_seller(seller.id).await.unwrap().balance,
            Decimal::ZERO
        );
        assert!(store.all_logs().is_empty());

        unit.commit().await.unwrap();

        assert_eq!(
            store.credit_for_seller(seller.id).await.unwrap().balance,
            dec!(1000)
        );
        assert_eq!(store.all_logs().len(), 1);
        assert!(!store.is_locked(&seller.id));
    }

    #[tokio::test]
    async fn test_dropped_unit_rolls_back_and_unlocks() {
        let (store, seller, _) = store_with_seller().await;

        {
            let mut unit = store.begin().await.unwrap();
            let mut credit = unit.get_for_update(seller.id).await.unwrap();
            credit.apply(dec!(500)).unwrap();
            unit.save(&credit).await.unwrap();
            assert!(store.is_locked(&seller.id));
        }

        assert!(!store.is_locked(&seller.id));
        assert_eq!(
            store.credit_for_seller(seller.id).await.unwrap().balance,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_save_requires_lock() {
        let (store, _, credit) = store_with_seller().await;

        let mut unit = store.begin().await.unwrap();
        let err = unit.save(&credit).await.unwrap_err();
        assert!(matches!(err, CreditError::StorageFailure(_)));

        let err = unit
            .append_log(credit.id, dec!(10), LogType::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::StorageFailure(_)));
    }

    #[tokio::test]
    async fn test_missing_credit_is_not_found() {
        let store = MemoryLedgerStore::default();
        let mut unit = store.begin().await.unwrap();

        let err = unit.get_for_update(SellerId::new()).await.unwrap_err();
        assert!(matches!(err, CreditError::NotFound { entity: "credit", .. }));
    }

    #[tokio::test]
    async fn test_injected_commit_failure_discards_writes() {
        let (store, seller, _) = store_with_seller().await;
        store.inject_commit_failure();

        let mut unit = store.begin().await.unwrap();
        let mut credit = unit.get_for_update(seller.id).await.unwrap();
        credit.apply(dec!(1000)).unwrap();
        unit.save(&credit).await.unwrap();

        assert!(matches!(
            unit.commit().await,
            Err(CreditError::StorageFailure(_))
        ));
        assert_eq!(
            store.credit_for_seller(seller.id).await.unwrap().balance,
            Decimal::ZERO
        );
        assert!(!store.is_locked(&seller.id));
    }

    #[tokio::test]
    async fn test_all_logs_sorted_by_id_across_sellers() {
        let (store, first, _) = store_with_seller().await;
        let (second, _) = store
            .create_seller(Seller::new(UserId::new(), None, None))
            .await
            .unwrap();

        let mut early = store.begin().await.unwrap();
        let credit = early.get_for_update(first.id).await.unwrap();
        let early_log = early
            .append_log(credit.id, dec!(10), LogType::Deposit)
            .await
            .unwrap();

        let mut late = store.begin().await.unwrap();
        let credit = late.get_for_update(second.id).await.unwrap();
        let late_log = late
            .append_log(credit.id, dec!(20), LogType::Deposit)
            .await
            .unwrap();

        late.commit().await.unwrap();
        early.commit().await.unwrap();

        let ids: Vec<_> = store.all_logs().iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![early_log.id, late_log.id]);
    }

    #[tokio::test]
    async fn test_update_seller_replaces_names() {
        let (store, mut seller, _) = store_with_seller().await;

        seller.rename(Some("Sara".into()), None);
        let updated = store.update_seller(seller.clone()).await.unwrap();
        assert_eq!(updated.first_name.as_deref(), Some("Sara"));
        assert_eq!(store.seller(seller.id).await.unwrap(), updated);

        let err = store
            .update_seller(Seller::new(UserId::new(), None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_deposit_for_update_requires_seller_lock() {
        let (store, seller, credit) = store_with_seller().await;
        let deposit = store
            .insert_deposit(DepositRequest::new(seller.id, credit.id, dec!(100)))
            .await
            .unwrap();

        let mut unit = store.begin().await.unwrap();
        assert!(unit.deposit_for_update(deposit.id).await.is_err());

        unit.get_for_update(seller.id).await.unwrap();
        assert_eq!(
            unit.deposit_for_update(deposit.id).await.unwrap().status,
            DepositStatus::Pending
        );
    }
}
