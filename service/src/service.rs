//! The seller credit service.
//!
//! The narrow inbound interface for the outer shell. Every balance change is
//! delegated to the [`BalanceMutator`]; sale and deposit flows stage their
//! extra rows in the same unit of work so that a Sale, a deposit status change
//! and the balance they imply commit together or not at all.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use sellercredit_common::{CreditError, CreditId, DepositId, Result, SaleId, SellerId, UserId};
use sellercredit_ledger::validators::{
    precheck_balance, validate_deposit_amount, validate_phone_number,
};
use sellercredit_ledger::{
    finish_unit, BalanceMutator, DenominationSet, DepositRequest, DepositStatus, LedgerStore,
    LedgerSummary, LedgerViews, LogType, Page, Sale, Seller, TransactionLog, UnitOfWork,
};

use crate::config::ServiceConfig;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::state::ServiceState;

/// A seller together with its current balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerProfile {
    pub seller: Seller,
    pub credit_id: CreditId,
    pub balance: Decimal,
}

/// A committed sale and the balance it left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleReceipt {
    pub sale: Sale,
    pub balance: Decimal,
}

/// An approved deposit request and the resulting balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositApproval {
    pub deposit: DepositRequest,
    pub balance: Decimal,
}

/// Per-request outcome of a batch approval.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchApprovalOutcome {
    pub deposit_id: DepositId,
    pub result: Result<DepositApproval>,
}

/// Seller credit service over a ledger store.
pub struct CreditService<S: LedgerStore> {
    config: ServiceConfig,
    store: Arc<S>,
    mutator: BalanceMutator<S>,
    views: LedgerViews<S>,
    denominations: DenominationSet,
    state: Arc<RwLock<ServiceState>>,
    metrics: SharedMetrics,
    shutdown_tx: watch::Sender<bool>,
}

impl<S: LedgerStore> CreditService<S> {
    /// Create a service. It refuses mutations until [`CreditService::start`].
    pub fn new(store: Arc<S>, config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let denominations = config.denominations()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            mutator: BalanceMutator::new(Arc::clone(&store), config.ledger.clone()),
            views: LedgerViews::new(Arc::clone(&store)),
            store,
            denominations,
            state: Arc::new(RwLock::new(ServiceState::Starting)),
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
            config,
        })
    }

    /// Start accepting requests.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ServiceState::Starting {
                return Err(CreditError::ServiceUnavailable(format!(
                    "cannot start a service that is {}",
                    *state
                )));
            }
            *state = ServiceState::Running;
        }

        self.start_background_tasks();

        info!(
            denominations = self.denominations.amounts().count(),
            lock_timeout_ms = self.config.ledger.lock_timeout.as_millis() as u64,
            "Seller credit service started"
        );
        Ok(())
    }

    /// Stop gracefully: refuse new mutations, drain in-flight ones, stop.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping seller credit service");

        *self.state.write() = ServiceState::ShuttingDown;
        let _ = self.shutdown_tx.send(true);

        self.drain_mutations().await;

        *self.state.write() = ServiceState::Stopped;
        info!("Seller credit service stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared counters, e.g. for an export endpoint.
    pub fn metrics_handle(&self) -> SharedMetrics {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // --- Sellers ---

    /// Create a seller and its zero-balance credit in one step.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn register_seller(
        &self,
        user_id: UserId,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<SellerProfile> {
        let _guard = self.metrics.track_mutation();
        self.ensure_running()?;

        let seller = Seller::new(user_id, normalize_name(first_name), normalize_name(last_name));
        seller.validate()?;

        let (seller, credit) = self.store.create_seller(seller).await?;
        info!(
            seller_id = %seller.id,
            credit_id = %credit.id,
            name = %seller.display_name(),
            "Seller registered"
        );

        Ok(SellerProfile {
            seller,
            credit_id: credit.id,
            balance: credit.balance,
        })
    }

    /// Replace a seller's first and last name.
    ///
    /// Names are trimmed; blank names are cleared.
    #[instrument(skip_all, fields(seller_id = %seller_id))]
    pub async fn update_seller_profile(
        &self,
        seller_id: SellerId,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<SellerProfile> {
        let _guard = self.metrics.track_mutation();
        self.ensure_running()?;

        let mut seller = self.store.seller(seller_id).await?;
        seller.rename(normalize_name(first_name), normalize_name(last_name));
        seller.validate()?;

        let seller = self.store.update_seller(seller).await?;
        info!(name = %seller.display_name(), "Seller profile updated");
        self.profile(seller).await
    }

    /// Seller with its committed balance.
    pub async fn seller_profile(&self, seller_id: SellerId) -> Result<SellerProfile> {
        let seller = self.store.seller(seller_id).await?;
        self.profile(seller).await
    }

    /// Profile of the seller linked to a user.
    pub async fn profile_for_user(&self, user_id: UserId) -> Result<SellerProfile> {
        let seller = self.store.seller_for_user(user_id).await?;
        self.profile(seller).await
    }

    async fn profile(&self, seller: Seller) -> Result<SellerProfile> {
        let credit = self.store.credit_for_seller(seller.id).await?;
        Ok(SellerProfile {
            seller,
            credit_id: credit.id,
            balance: credit.balance,
        })
    }

    // --- Sales ---

    /// Charge a phone number and debit the seller's balance.
    ///
    /// The balance pre-check only fails fast; sufficiency is decided again
    /// under the credit lock.
    #[instrument(skip_all, fields(seller_id = %seller_id, amount = %amount))]
    pub async fn create_sale(
        &self,
        seller_id: SellerId,
        amount: Decimal,
        phone_number: &str,
    ) -> Result<SaleReceipt> {
        let _guard = self.metrics.track_mutation();
        self.metrics.sale_attempted();

        let outcome = self.execute_sale(seller_id, amount, phone_number).await;
        self.metrics.sale_finished(&outcome);
        outcome
    }

    async fn execute_sale(
        &self,
        seller_id: SellerId,
        amount: Decimal,
        phone_number: &str,
    ) -> Result<SaleReceipt> {
        self.ensure_running()?;

        let amount = self.denominations.validate(amount)?;
        let phone_number = validate_phone_number(phone_number)?;

        let snapshot = self.store.credit_for_seller(seller_id).await?;
        if let Err(err) = precheck_balance(&snapshot, amount) {
            info!(balance = %snapshot.balance, "Sale rejected by balance pre-check");
            return Err(err);
        }

        let store = Arc::clone(&self.store);
        let (unit, result) = self
            .mutator
            .bounded(async move {
                let mut unit = store.begin().await?;
                let result = Self::stage_sale(&mut unit, seller_id, amount, phone_number).await;
                Ok::<_, CreditError>((unit, result))
            })
            .await?;
        let receipt = finish_unit(unit, result).await?;

        charge_phone(&receipt.sale);
        info!(
            sale_id = %receipt.sale.id,
            balance = %receipt.balance,
            "Sale created"
        );
        Ok(receipt)
    }

    async fn stage_sale(
        unit: &mut S::Unit,
        seller_id: SellerId,
        amount: Decimal,
        phone_number: String,
    ) -> Result<SaleReceipt> {
        let applied =
            BalanceMutator::<S>::apply_in(unit, seller_id, LogType::Sale.signed(amount), LogType::Sale)
                .await?;
        let sale = unit
            .insert_sale(Sale::new(seller_id, amount, phone_number))
            .await?;

        Ok(SaleReceipt {
            sale,
            balance: applied.credit.balance,
        })
    }

    /// A sale owned by the seller. Other sellers' sales are `NotFound`.
    pub async fn sale(&self, seller_id: SellerId, sale_id: SaleId) -> Result<Sale> {
        let sale = self.store.sale(sale_id).await?;
        if sale.seller_id != seller_id {
            return Err(CreditError::not_found("sale", sale_id));
        }
        Ok(sale)
    }

    /// A seller's sales, oldest first.
    pub async fn sales(&self, seller_id: SellerId, page: Page) -> Result<Vec<Sale>> {
        self.store.seller(seller_id).await?;
        self.store
            .sales_for_seller(seller_id, page.clamped(self.config.max_page_size))
            .await
    }

    // --- Deposits ---

    /// Submit a PENDING deposit request.
    #[instrument(skip_all, fields(seller_id = %seller_id, amount = %amount))]
    pub async fn request_deposit(
        &self,
        seller_id: SellerId,
        amount: Decimal,
    ) -> Result<DepositRequest> {
        let _guard = self.metrics.track_mutation();
        self.ensure_running()?;

        let amount = validate_deposit_amount(amount)?;
        let credit = self.store.credit_for_seller(seller_id).await?;
        let deposit = self
            .store
            .insert_deposit(DepositRequest::new(seller_id, credit.id, amount))
            .await?;

        self.metrics.deposit_requested();
        info!(deposit_id = %deposit.id, "Deposit requested");
        Ok(deposit)
    }

    /// Approve a PENDING request and credit its amount.
    ///
    /// The status change, the balance increase and its DEPOSIT log entry
    /// commit together. A request that is no longer PENDING fails with
    /// `InvalidTransition` and has no balance effect.
    #[instrument(skip(self))]
    pub async fn approve_deposit(&self, deposit_id: DepositId) -> Result<DepositApproval> {
        let _guard = self.metrics.track_mutation();
        self.ensure_running()?;

        let outcome = self.execute_approval(deposit_id).await;
        match &outcome {
            Ok(approval) => {
                self.metrics.deposit_approved();
                info!(
                    seller_id = %approval.deposit.seller_id,
                    amount = %approval.deposit.amount,
                    balance = %approval.balance,
                    "Deposit approved"
                );
            }
            Err(err) => {
                self.metrics.record_timeout(err);
                warn!(error = %err, "Deposit approval failed");
            }
        }
        outcome
    }

    async fn execute_approval(&self, deposit_id: DepositId) -> Result<DepositApproval> {
        let seller_id = self.store.deposit(deposit_id).await?.seller_id;
        let store = Arc::clone(&self.store);

        let (unit, result) = self
            .mutator
            .bounded(async move {
                let mut unit = store.begin().await?;
                let result = Self::stage_approval(&mut unit, seller_id, deposit_id).await;
                Ok::<_, CreditError>((unit, result))
            })
            .await?;
        finish_unit(unit, result).await
    }

    async fn stage_approval(
        unit: &mut S::Unit,
        seller_id: SellerId,
        deposit_id: DepositId,
    ) -> Result<DepositApproval> {
        // The seller lock serializes every transition of this request.
        unit.get_for_update(seller_id).await?;

        let mut deposit = unit.deposit_for_update(deposit_id).await?;
        deposit.transition_to(DepositStatus::Approved)?;

        let delta = LogType::Deposit.signed(deposit.amount);
        let applied = BalanceMutator::<S>::apply_in(unit, seller_id, delta, LogType::Deposit).await?;
        unit.save_deposit(&deposit).await?;

        Ok(DepositApproval {
            deposit,
            balance: applied.credit.balance,
        })
    }

    /// Reject a PENDING request. No balance effect.
    #[instrument(skip(self))]
    pub async fn reject_deposit(&self, deposit_id: DepositId) -> Result<DepositRequest> {
        let _guard = self.metrics.track_mutation();
        self.ensure_running()?;

        let seller_id = self.store.deposit(deposit_id).await?.seller_id;
        let store = Arc::clone(&self.store);

        let staged = self
            .mutator
            .bounded(async move {
                let mut unit = store.begin().await?;
                let result = Self::stage_rejection(&mut unit, seller_id, deposit_id).await;
                Ok::<_, CreditError>((unit, result))
            })
            .await;
        let outcome = match staged {
            Ok((unit, result)) => finish_unit(unit, result).await,
            Err(err) => Err(err),
        };

        match &outcome {
            Ok(_) => {
                self.metrics.deposit_rejected();
                info!(seller_id = %seller_id, "Deposit rejected");
            }
            Err(err) => self.metrics.record_timeout(err),
        }
        outcome
    }

    async fn stage_rejection(
        unit: &mut S::Unit,
        seller_id: SellerId,
        deposit_id: DepositId,
    ) -> Result<DepositRequest> {
        unit.get_for_update(seller_id).await?;

        let mut deposit = unit.deposit_for_update(deposit_id).await?;
        deposit.transition_to(DepositStatus::Rejected)?;
        unit.save_deposit(&deposit).await?;

        Ok(deposit)
    }

    /// Approve several requests, each in its own unit of work.
    ///
    /// One failure does not affect the others; the outcome list follows the
    /// input order.
    #[instrument(skip_all, fields(count = deposit_ids.len()))]
    pub async fn approve_deposits(&self, deposit_ids: &[DepositId]) -> Vec<BatchApprovalOutcome> {
        let mut outcomes = Vec::with_capacity(deposit_ids.len());

        for &deposit_id in deposit_ids {
            let result = self.approve_deposit(deposit_id).await;
            outcomes.push(BatchApprovalOutcome { deposit_id, result });
        }

        let approved = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!(
            approved,
            failed = outcomes.len() - approved,
            "Batch approval finished"
        );
        outcomes
    }

    /// A deposit request owned by the seller.
    pub async fn deposit(&self, seller_id: SellerId, deposit_id: DepositId) -> Result<DepositRequest> {
        let deposit = self.store.deposit(deposit_id).await?;
        if deposit.seller_id != seller_id {
            return Err(CreditError::not_found("deposit request", deposit_id));
        }
        Ok(deposit)
    }

    /// A seller's deposit requests, oldest first.
    pub async fn deposits(&self, seller_id: SellerId, page: Page) -> Result<Vec<DepositRequest>> {
        self.store.seller(seller_id).await?;
        self.store
            .deposits_for_seller(seller_id, page.clamped(self.config.max_page_size))
            .await
    }

    // --- Reporting ---

    /// Sum of SALE log amounts.
    pub async fn total_sales(&self, seller_id: SellerId) -> Result<Decimal> {
        let credit = self.store.credit_for_seller(seller_id).await?;
        self.views.total_sales(credit.id).await
    }

    /// Sum of DEPOSIT log amounts.
    pub async fn total_deposits(&self, seller_id: SellerId) -> Result<Decimal> {
        let credit = self.store.credit_for_seller(seller_id).await?;
        self.views.total_deposits(credit.id).await
    }

    /// Sum of APPROVED deposit request amounts.
    pub async fn approved_deposit_total(&self, seller_id: SellerId) -> Result<Decimal> {
        let credit = self.store.credit_for_seller(seller_id).await?;
        self.views.approved_deposit_total(credit.id).await
    }

    pub async fn balance(&self, seller_id: SellerId) -> Result<Decimal> {
        self.views.balance(seller_id).await
    }

    pub async fn ledger_summary(&self, seller_id: SellerId) -> Result<LedgerSummary> {
        self.views.summary(seller_id).await
    }

    /// Transaction log page; the limit is clamped to the configured maximum.
    pub async fn transaction_logs(
        &self,
        seller_id: SellerId,
        page: Page,
    ) -> Result<Vec<TransactionLog>> {
        self.views
            .transaction_logs(seller_id, page.clamped(self.config.max_page_size))
            .await
    }

    // --- Private methods ---

    fn ensure_running(&self) -> Result<()> {
        let state = *self.state.read();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(CreditError::ServiceUnavailable(format!("service is {state}")))
        }
    }

    fn start_background_tasks(&self) {
        let store = Arc::clone(&self.store);
        let interval = self.config.lock_cleanup_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => store.cleanup_idle(),
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Lock cleanup loop stopped");
        });
    }

    async fn drain_mutations(&self) {
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            loop {
                let active = self.metrics.snapshot().mutations_active;
                if active == 0 {
                    break;
                }
                debug!(active, "Waiting for in-flight mutations");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                active = self.metrics.snapshot().mutations_active,
                "Drain timeout elapsed with mutations still in flight"
            );
        }
    }
}

/// Hand-off to the phone top-up provider. No gateway is wired in.
fn charge_phone(sale: &Sale) {
    info!(
        sale_id = %sale.id,
        phone_number = %sale.phone_number,
        amount = %sale.amount,
        "Charging phone number"
    );
}

fn normalize_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}
