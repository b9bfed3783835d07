//! The balance mutator.
//!
//! The single place where a credit balance changes. Each call locks the
//! seller's credit, re-checks sufficiency under the lock, writes the new
//! balance and its log entry, and commits them together.

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use sellercredit_common::{fits_fixed_point, CreditError, Direction, Result, SellerId};

use crate::config::LedgerConfig;
use crate::credit::Credit;
use crate::store::{finish_unit, LedgerStore, UnitOfWork};
use crate::transaction_log::{LogType, TransactionLog};

/// Outcome of a delta applied inside a unit of work.
#[derive(Debug, Clone)]
pub struct AppliedDelta {
    /// Credit after the change.
    pub credit: Credit,
    /// Log entry documenting the change.
    pub log: TransactionLog,
}

/// Atomically debits or credits seller balances.
pub struct BalanceMutator<S: LedgerStore> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S: LedgerStore> Clone for BalanceMutator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: LedgerStore> BalanceMutator<S> {
    /// Create a mutator over a store.
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Apply a signed delta to a seller's balance and log it.
    ///
    /// Either the new balance and its log entry are both committed, or
    /// nothing is. Debits that would overdraw fail with
    /// `InsufficientBalance`.
    #[instrument(skip_all, fields(seller_id = %seller_id, delta = %signed_amount, log_type = %log_type))]
    pub async fn apply_delta(
        &self,
        seller_id: SellerId,
        signed_amount: Decimal,
        log_type: LogType,
    ) -> Result<Credit> {
        let store = Arc::clone(&self.store);

        let (unit, result) = self
            .bounded(async move {
                let mut unit = store.begin().await?;
                let result = Self::apply_in(&mut unit, seller_id, signed_amount, log_type).await;
                Ok::<_, CreditError>((unit, result))
            })
            .await?;
        let applied = finish_unit(unit, result).await?;

        info!(
            seller_id = %seller_id,
            balance = %applied.credit.balance,
            log_id = %applied.log.id,
            "Balance updated"
        );
        Ok(applied.credit)
    }

    /// Apply a delta inside a caller-owned unit of work.
    ///
    /// Used by flows that must commit other rows in the same unit (a sale
    /// record, a deposit status change). Nothing is visible until the caller
    /// commits.
    pub async fn apply_in(
        unit: &mut S::Unit,
        seller_id: SellerId,
        signed_amount: Decimal,
        log_type: LogType,
    ) -> Result<AppliedDelta> {
        check_delta(signed_amount, log_type)?;

        let mut credit = match unit.get_for_update(seller_id).await {
            Ok(credit) => credit,
            Err(CreditError::NotFound { entity, id }) => {
                error!(
                    seller_id = %seller_id,
                    "Seller has no credit row; lifecycle invariant violated"
                );
                return Err(CreditError::NotFound { entity, id });
            }
            Err(err) => return Err(err),
        };

        let before = credit.balance;
        if let Err(err) = credit.apply(signed_amount) {
            if matches!(err, CreditError::InsufficientBalance { .. }) {
                info!(
                    seller_id = %seller_id,
                    balance = %before,
                    requested = %signed_amount.abs(),
                    "Debit rejected: insufficient balance"
                );
            } else {
                info!(
                    seller_id = %seller_id,
                    balance = %before,
                    delta = %signed_amount,
                    "Delta rejected: balance would exceed storage precision"
                );
            }
            return Err(err);
        }

        unit.save(&credit).await?;
        let log = unit
            .append_log(credit.id, signed_amount.abs(), log_type)
            .await?;

        debug!(
            seller_id = %seller_id,
            before = %before,
            after = %credit.balance,
            direction = ?Direction::of(signed_amount),
            "Delta staged"
        );

        Ok(AppliedDelta { credit, log })
    }

    /// Run the staging part of a unit of work under the configured time bound.
    ///
    /// When the bound elapses the future is dropped, which rolls back its
    /// unit and releases its locks. Callers commit outside the bound: once
    /// `COMMIT` is sent its outcome must be awaited, never abandoned.
    pub async fn bounded<T, F>(&self, unit_of_work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.unit_timeout, unit_of_work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.config.unit_timeout.as_millis() as u64,
                    "Unit of work exceeded its time bound; rolled back"
                );
                Err(CreditError::ConflictTimeout(
                    "unit of work time bound".to_string(),
                ))
            }
        }
    }
}

/// Reject deltas whose sign disagrees with the log type or that cannot be stored.
fn check_delta(signed_amount: Decimal, log_type: LogType) -> Result<()> {
    if signed_amount.is_zero() {
        return Err(CreditError::invalid_amount(
            signed_amount,
            "delta must be non-zero",
        ));
    }

    if !fits_fixed_point(signed_amount) {
        return Err(CreditError::invalid_amount(
            signed_amount,
            "at most two decimal places and ten digits",
        ));
    }

    let expected = match log_type {
        LogType::Deposit => Direction::Credit,
        LogType::Sale => Direction::Debit,
    };
    if Direction::of(signed_amount) != expected {
        return Err(CreditError::invalid_amount(
            signed_amount,
            format!("{log_type} entries require a {expected:?} delta"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seller::Seller;
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;
    use sellercredit_common::UserId;

    async fn create_test_mutator() -> (BalanceMutator<MemoryLedgerStore>, SellerId) {
        let store = Arc::new(MemoryLedgerStore::default());
        let (seller, _) = store
            .create_seller(Seller::new(UserId::new(), None, None))
            .await
            .unwrap();
        (BalanceMutator::new(store, LedgerConfig::default()), seller.id)
    }

    #[tokio::test]
    async fn test_deposit_then_sale() {
        let (mutator, seller) = create_test_mutator().await;

        let credit = mutator
            .apply_delta(seller, dec!(2000), LogType::Deposit)
            .await
            .unwrap();
        assert_eq!(credit.balance, dec!(2000));

        let credit = mutator
            .apply_delta(seller, dec!(-1000), LogType::Sale)
            .await
            .unwrap();
        assert_eq!(credit.balance, dec!(1000));
        assert_eq!(mutator.store().all_logs().len(), 2);
    }

    #[tokio::test]
    async fn test_sign_must_match_type() {
        let (mutator, seller) = create_test_mutator().await;

        let err = mutator
            .apply_delta(seller, dec!(1000), LogType::Sale)
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidAmount { .. }));

        let err = mutator
            .apply_delta(seller, dec!(-1000), LogType::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidAmount { .. }));

        let err = mutator
            .apply_delta(seller, Decimal::ZERO, LogType::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_precision_rejected() {
        let (mutator, seller) = create_test_mutator().await;

        let err = mutator
            .apply_delta(seller, dec!(10.005), LogType::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_unknown_seller_is_not_found() {
        let (mutator, _) = create_test_mutator().await;

        let err = mutator
            .apply_delta(SellerId::new(), dec!(10), LogType::Deposit)
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_balance_past_storage_precision_rejected() {
        let (mutator, seller) = create_test_mutator().await;

        mutator
            .apply_delta(seller, dec!(99999999.99), LogType::Deposit)
            .await
            .unwrap();
        let err = mutator
            .apply_delta(seller, dec!(1), LogType::Deposit)
            .await
            .unwrap_err();

        assert!(matches!(err, CreditError::InvalidAmount { .. }));
        let credit = mutator.store().credit_for_seller(seller).await.unwrap();
        assert_eq!(credit.balance, dec!(99999999.99));
        assert_eq!(mutator.store().all_logs().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_commit_not_cut_off_by_unit_bound() {
        let store = Arc::new(MemoryLedgerStore::default());
        let (seller, _) = store
            .create_seller(Seller::new(UserId::new(), None, None))
            .await
            .unwrap();
        let config = LedgerConfig {
            lock_timeout: std::time::Duration::from_millis(20),
            unit_timeout: std::time::Duration::from_millis(50),
        };
        let mutator = BalanceMutator::new(Arc::clone(&store), config);

        store.inject_commit_delay(std::time::Duration::from_millis(200));
        let credit = mutator
            .apply_delta(seller.id, dec!(1000), LogType::Deposit)
            .await
            .unwrap();

        assert_eq!(credit.balance, dec!(1000));
        assert_eq!(
            store.credit_for_seller(seller.id).await.unwrap().balance,
            dec!(1000)
        );
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let store = Arc::new(MemoryLedgerStore::default());
        let config = LedgerConfig {
            lock_timeout: std::time::Duration::from_millis(10),
            unit_timeout: std::time::Duration::from_millis(20),
        };
        let mutator = BalanceMutator::new(store, config);

        let result: Result<()> = mutator
            .bounded(async {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CreditError::ConflictTimeout(_))));
    }
}
