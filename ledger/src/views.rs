//! Read-only reporting over the ledger.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use sellercredit_common::{CreditId, Result, SellerId};

use crate::store::{LedgerStore, Page};
use crate::transaction_log::{LogType, TransactionLog};

/// Balance and log totals for one credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Credit the summary was taken for.
    pub credit_id: CreditId,
    /// Committed balance.
    pub balance: Decimal,
    /// Sum of DEPOSIT log amounts.
    pub total_deposits: Decimal,
    /// Sum of SALE log amounts.
    pub total_sales: Decimal,
    /// Number of log entries.
    pub entries: u64,
    /// Whether balance equals deposits minus sales.
    pub is_consistent: bool,
}

/// Reporting queries. None of these lock.
pub struct LedgerViews<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> Clone for LedgerViews<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> LedgerViews<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Sum of SALE amounts for a credit; zero when there are none.
    pub async fn total_sales(&self, credit_id: CreditId) -> Result<Decimal> {
        self.store.sum_by_type(credit_id, LogType::Sale).await
    }

    /// Sum of DEPOSIT log amounts for a credit; zero when there are none.
    pub async fn total_deposits(&self, credit_id: CreditId) -> Result<Decimal> {
        self.store.sum_by_type(credit_id, LogType::Deposit).await
    }

    /// Sum of APPROVED deposit request amounts for a credit.
    pub async fn approved_deposit_total(&self, credit_id: CreditId) -> Result<Decimal> {
        self.store.approved_deposit_total(credit_id).await
    }

    /// Committed balance for a seller.
    pub async fn balance(&self, seller_id: SellerId) -> Result<Decimal> {
        Ok(self.store.credit_for_seller(seller_id).await?.balance)
    }

    /// Balance and totals with a consistency flag.
    ///
    /// The balance and the totals are two reads; a mutation committing in
    /// between can produce a transient mismatch.
    #[instrument(skip(self))]
    pub async fn summary(&self, seller_id: SellerId) -> Result<LedgerSummary> {
        let credit = self.store.credit_for_seller(seller_id).await?;
        let totals = self.store.log_totals(credit.id).await?;
        let is_consistent = totals.net() == credit.balance;

        if !is_consistent {
            warn!(
                seller_id = %seller_id,
                balance = %credit.balance,
                net = %totals.net(),
                "Balance does not match log totals"
            );
        }

        Ok(LedgerSummary {
            credit_id: credit.id,
            balance: credit.balance,
            total_deposits: totals.deposits,
            total_sales: totals.sales,
            entries: totals.entries,
            is_consistent,
        })
    }

    /// Log entries for a seller's credit in id order.
    pub async fn transaction_logs(
        &self,
        seller_id: SellerId,
        page: Page,
    ) -> Result<Vec<TransactionLog>> {
        let credit = self.store.credit_for_seller(seller_id).await?;
        self.store.logs_for_credit(credit.id, page).await
    }
}
