//! Simulation controller.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use sellercredit_common::{SellerId, UserId};
use sellercredit_ledger::{LedgerStore, Page};
use sellercredit_service::CreditService;

use crate::metrics::{Operation, SimulationMetrics};
use crate::scenario::{AssertCondition, Scenario, ScenarioStep};

const SCENARIO_PHONE: &str = "09120000000";

/// Ledger totals across all simulated sellers after a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub sellers: usize,
    pub total_balance: Decimal,
    pub total_deposits: Decimal,
    pub total_sales: Decimal,
    pub log_entries: u64,
}

/// Controls the simulation.
pub struct SimulationController<S: LedgerStore> {
    service: Arc<CreditService<S>>,
    seller_count: usize,
    workers: usize,
    seed: u64,
    sellers: Arc<Vec<SellerId>>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    running: Arc<RwLock<bool>>,
}

impl<S: LedgerStore> SimulationController<S> {
    /// Create a new simulation controller.
    pub fn new(
        service: Arc<CreditService<S>>,
        seller_count: usize,
        workers: usize,
        seed: Option<u64>,
    ) -> Self {
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());

        Self {
            service,
            seller_count,
            workers: workers.max(1),
            seed,
            sellers: Arc::new(Vec::new()),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Register sellers and fund each with an approved deposit.
    pub async fn initialize(&mut self, initial_deposit: Decimal) -> anyhow::Result<()> {
        info!(
            sellers = self.seller_count,
            seed = self.seed,
            "Initializing simulation"
        );

        let mut sellers = Vec::with_capacity(self.seller_count);
        for index in 0..self.seller_count {
            let profile = self
                .service
                .register_seller(UserId::new(), Some(format!("Seller {index}")), None)
                .await?;

            if initial_deposit > Decimal::ZERO {
                let deposit = self
                    .service
                    .request_deposit(profile.seller.id, initial_deposit)
                    .await?;
                self.service.approve_deposit(deposit.id).await?;
            }

            debug!(seller_id = %profile.seller.id, "Seller initialized");
            sellers.push(profile.seller.id);
        }

        self.sellers = Arc::new(sellers);
        Ok(())
    }

    /// Run a scenario.
    pub async fn run_scenario(&self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        if scenario.sellers > self.sellers.len() {
            anyhow::bail!(
                "scenario {} needs {} sellers, only {} registered",
                scenario.name,
                scenario.sellers,
                self.sellers.len()
            );
        }

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    /// Generate random traffic.
    ///
    /// Stops after `duration`, after `request_budget` requests, or on Ctrl+C
    /// when neither is given.
    pub async fn run(
        &self,
        duration: Option<Duration>,
        request_budget: Option<u64>,
    ) -> anyhow::Result<()> {
        info!(
            workers = self.workers,
            duration_secs = duration.map(|d| d.as_secs()),
            request_budget,
            "Generating random traffic"
        );

        if self.sellers.is_empty() {
            anyhow::bail!("no sellers registered");
        }

        *self.running.write().await = true;
        let issued = Arc::new(AtomicU64::new(0));
        let denominations = self.service.config().sale_denominations.clone();

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let load = LoadWorker {
                service: Arc::clone(&self.service),
                sellers: Arc::clone(&self.sellers),
                denominations: denominations.clone(),
                metrics: Arc::clone(&self.metrics),
                running: Arc::clone(&self.running),
                issued: Arc::clone(&issued),
                request_budget,
                rng: StdRng::seed_from_u64(self.seed.wrapping_add(worker as u64)),
            };
            handles.push(tokio::spawn(load.run()));
        }

        let running = Arc::clone(&self.running);
        let stopper = tokio::spawn(async move {
            match (duration, request_budget) {
                (Some(d), _) => tokio::time::sleep(d).await,
                (None, Some(_)) => std::future::pending::<()>().await,
                (None, None) => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for Ctrl+C");
                    }
                }
            }
            *running.write().await = false;
        });

        for handle in handles {
            handle.await?;
        }
        stopper.abort();
        *self.running.write().await = false;

        Ok(())
    }

    /// Check the ledger invariants for every seller.
    pub async fn verify(&self) -> anyhow::Result<VerificationReport> {
        let mut report = VerificationReport {
            sellers: self.sellers.len(),
            ..VerificationReport::default()
        };
        let mut violations = Vec::new();

        for &seller in self.sellers.iter() {
            let summary = self.service.ledger_summary(seller).await?;
            let approved = self.service.approved_deposit_total(seller).await?;

            if !summary.is_consistent {
                violations.push(format!(
                    "seller {seller}: balance {} but deposits - sales = {}",
                    summary.balance,
                    summary.total_deposits - summary.total_sales
                ));
            }
            if summary.balance < Decimal::ZERO {
                violations.push(format!("seller {seller}: negative balance {}", summary.balance));
            }
            if approved != summary.total_deposits {
                violations.push(format!(
                    "seller {seller}: approved deposits {approved} but deposit logs {}",
                    summary.total_deposits
                ));
            }

            report.total_balance += summary.balance;
            report.total_deposits += summary.total_deposits;
            report.total_sales += summary.total_sales;
            report.log_entries += summary.entries;
        }

        if !violations.is_empty() {
            for violation in &violations {
                warn!("{}", violation);
            }
            anyhow::bail!("{} ledger invariant violations", violations.len());
        }

        Ok(report)
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Execute a single scenario step.
    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::Deposit { seller, amount } => {
                let seller = self.seller(*seller)?;
                deposit(&self.service, &self.metrics, seller, parse_amount(amount)?, true).await;
            }
            ScenarioStep::RejectedDeposit { seller, amount } => {
                let seller = self.seller(*seller)?;
                deposit(&self.service, &self.metrics, seller, parse_amount(amount)?, false).await;
            }
            ScenarioStep::Sale { seller, amount } => {
                let seller = self.seller(*seller)?;
                sell(&self.service, &self.metrics, seller, parse_amount(amount)?, SCENARIO_PHONE)
                    .await;
            }
            ScenarioStep::ConcurrentSales {
                seller,
                amount,
                count,
            } => {
                let seller = self.seller(*seller)?;
                let amount = parse_amount(amount)?;
                info!(seller_id = %seller, %amount, count, "Firing concurrent sales");

                let mut handles = Vec::with_capacity(*count);
                for _ in 0..*count {
                    let service = Arc::clone(&self.service);
                    let metrics = Arc::clone(&self.metrics);
                    handles.push(tokio::spawn(async move {
                        sell(&service, &metrics, seller, amount, SCENARIO_PHONE).await
                    }));
                }
                for handle in handles {
                    handle.await?;
                }
            }
            ScenarioStep::RandomLoad { requests } => {
                self.run(None, Some(*requests)).await?;
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
            }
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { seller, amount } => {
                let expected = parse_amount(amount)?;
                let balance = self.service.balance(self.seller(*seller)?).await?;
                if balance != expected {
                    anyhow::bail!("seller {seller}: balance {balance}, expected {expected}");
                }
            }
            AssertCondition::SaleCount { seller, count } => {
                let actual = self.count_sales(self.seller(*seller)?).await?;
                if actual != *count {
                    anyhow::bail!("seller {seller}: {actual} sales, expected {count}");
                }
            }
            AssertCondition::LedgerConsistent => {
                self.verify().await?;
            }
        }

        info!(?condition, "Assertion passed");
        Ok(())
    }

    async fn count_sales(&self, seller: SellerId) -> anyhow::Result<usize> {
        let page_size = self.service.config().max_page_size;
        let mut total = 0;

        loop {
            let page = Page::new(page_size, total);
            let sales = self.service.sales(seller, page).await?;
            total += sales.len();
            if sales.len() < page_size {
                return Ok(total);
            }
        }
    }

    fn seller(&self, index: usize) -> anyhow::Result<SellerId> {
        self.sellers
            .get(index)
            .copied()
            .with_context(|| format!("no seller at index {index}"))
    }
}

/// One random-traffic task.
struct LoadWorker<S: LedgerStore> {
    service: Arc<CreditService<S>>,
    sellers: Arc<Vec<SellerId>>,
    denominations: Vec<Decimal>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    running: Arc<RwLock<bool>>,
    issued: Arc<AtomicU64>,
    request_budget: Option<u64>,
    rng: StdRng,
}

impl<S: LedgerStore> LoadWorker<S> {
    async fn run(mut self) {
        loop {
            if !*self.running.read().await {
                break;
            }
            if let Some(budget) = self.request_budget {
                if self.issued.fetch_add(1, Ordering::Relaxed) >= budget {
                    break;
                }
            }

            let seller = self.sellers[self.rng.gen_range(0..self.sellers.len())];
            let roll = self.rng.gen_range(0..10);

            if roll < 7 {
                let amount = self.denominations[self.rng.gen_range(0..self.denominations.len())];
                let phone = format!("09{:09}", self.rng.gen_range(0..1_000_000_000u32));
                sell(&self.service, &self.metrics, seller, amount, &phone).await;
            } else {
                let amount = Decimal::from(self.rng.gen_range(1..=20) * 1000);
                deposit(&self.service, &self.metrics, seller, amount, roll < 9).await;
            }
        }
    }
}

async fn sell<S: LedgerStore>(
    service: &CreditService<S>,
    metrics: &RwLock<SimulationMetrics>,
    seller: SellerId,
    amount: Decimal,
    phone: &str,
) {
    let started = Instant::now();
    let result = service.create_sale(seller, amount, phone).await;
    let latency = started.elapsed().as_micros() as u64;

    let mut metrics = metrics.write().await;
    match result {
        Ok(_) => metrics.record_success(Operation::Sale, latency),
        Err(err) => {
            debug!(seller_id = %seller, error = %err, "Sale failed");
            metrics.record_failure(&err);
        }
    }
}

async fn deposit<S: LedgerStore>(
    service: &CreditService<S>,
    metrics: &RwLock<SimulationMetrics>,
    seller: SellerId,
    amount: Decimal,
    approve: bool,
) {
    let started = Instant::now();
    let result = match service.request_deposit(seller, amount).await {
        Ok(request) if approve => service
            .approve_deposit(request.id)
            .await
            .map(|_| Operation::DepositApproved),
        Ok(request) => service
            .reject_deposit(request.id)
            .await
            .map(|_| Operation::DepositRejected),
        Err(err) => Err(err),
    };
    let latency = started.elapsed().as_micros() as u64;

    let mut metrics = metrics.write().await;
    match result {
        Ok(operation) => metrics.record_success(operation, latency),
        Err(err) => {
            warn!(seller_id = %seller, error = %err, "Deposit failed");
            metrics.record_failure(&err);
        }
    }
}

fn parse_amount(amount: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(amount).with_context(|| format!("invalid amount {amount:?}"))
}
