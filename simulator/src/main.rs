//! Seller Credit Simulator
//!
//! Replays concurrent sale and deposit traffic against the credit service
//! and checks the ledger invariants at the end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sellercredit_ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use sellercredit_service::{CreditService, ServiceConfig};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// Seller Credit Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Seller credit load generator and consistency checker")]
struct Args {
    /// Number of simulated sellers to register
    #[arg(short = 'n', long, default_value = "8")]
    sellers: usize,

    /// Concurrent request workers
    #[arg(short, long, default_value = "16")]
    workers: usize,

    /// Built-in scenario name or path to a JSON scenario
    #[arg(short, long)]
    scenario: Option<String>,

    /// Approved deposit each seller starts with
    #[arg(long, default_value = "5000")]
    initial_deposit: Decimal,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C or the request budget)
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Stop after this many requests
    #[arg(long)]
    requests: Option<u64>,

    /// Emit logs and the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Seller Credit Simulator");

    let config = ServiceConfig::from_env()?;
    config.validate()?;

    match config.database_url.clone() {
        Some(url) => {
            info!("Using PostgreSQL ledger store");
            let store = PgLedgerStore::connect(&url, &config.ledger).await?;
            store.migrate().await?;
            simulate(Arc::new(store), config, args).await
        }
        None => {
            info!("Using in-memory ledger store");
            let store = MemoryLedgerStore::new(&config.ledger);
            simulate(Arc::new(store), config, args).await
        }
    }
}

async fn simulate<S: LedgerStore>(
    store: Arc<S>,
    config: ServiceConfig,
    args: Args,
) -> anyhow::Result<()> {
    let scenario = args.scenario.as_deref().map(Scenario::load).transpose()?;
    let seller_count = scenario
        .as_ref()
        .map_or(args.sellers, |s| s.sellers.max(args.sellers));

    let service = Arc::new(CreditService::new(store, config)?);
    service.start().await?;

    let mut controller =
        SimulationController::new(Arc::clone(&service), seller_count, args.workers, args.seed);

    // Scenarios fund their own sellers.
    let initial_deposit = if scenario.is_some() {
        Decimal::ZERO
    } else {
        args.initial_deposit
    };
    controller.initialize(initial_deposit).await?;

    let started = Instant::now();
    match scenario {
        Some(scenario) => controller.run_scenario(scenario).await?,
        None => {
            let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
            controller.run(duration, args.requests).await?;
        }
    }
    let elapsed = started.elapsed().as_secs_f64();

    let report = controller.verify().await?;
    service.stop().await?;

    let metrics = controller.metrics().await;
    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "metrics": metrics,
                "ledger": report,
                "service": {
                    "sales_attempted": service.metrics().sales_attempted,
                    "lock_timeouts": service.metrics().lock_timeouts,
                },
                "elapsed_secs": elapsed,
            })
        );
    } else {
        info!("Simulation complete");
        info!("Total requests: {}", metrics.total_requests);
        info!("Sales succeeded: {}", metrics.sales_succeeded);
        info!("Sales refused (insufficient balance): {}", metrics.sales_insufficient);
        info!(
            "Deposits approved/rejected: {}/{}",
            metrics.deposits_approved, metrics.deposits_rejected
        );
        info!("Timeouts: {}, other errors: {}", metrics.timeouts, metrics.errors);
        info!(
            "Latency avg/p50/p99: {}/{}/{}us",
            metrics.average_latency_us(),
            metrics.p50_latency_us(),
            metrics.p99_latency_us()
        );
        info!("Throughput: {:.1} req/s", metrics.throughput(elapsed));
        info!(
            "Ledger consistent across {} sellers: balance {}, deposits {}, sales {}",
            report.sellers, report.total_balance, report.total_deposits, report.total_sales
        );
    }

    Ok(())
}
