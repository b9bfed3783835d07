//! Service configuration.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use sellercredit_common::{CreditError, Result};
use sellercredit_ledger::{DenominationSet, LedgerConfig};

/// Main service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Lock and unit-of-work bounds.
    pub ledger: LedgerConfig,
    /// Amounts a sale may charge.
    pub sale_denominations: Vec<Decimal>,
    /// PostgreSQL URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Largest page any list read returns.
    pub max_page_size: usize,
    /// How often idle per-seller lock slots are dropped.
    pub lock_cleanup_interval: Duration,
    /// How long `stop` waits for in-flight mutations.
    pub drain_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            sale_denominations: [1000, 2000, 5000, 10_000, 20_000, 50_000]
                .into_iter()
                .map(Decimal::from)
                .collect(),
            database_url: None,
            max_page_size: 100,
            lock_cleanup_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Malformed values are reported rather than silently replaced.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            ledger: LedgerConfig::from_env(),
            ..Self::default()
        };

        if let Ok(list) = std::env::var("SALE_DENOMINATIONS") {
            config.sale_denominations = parse_denominations(&list)?;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = Some(url);
            }
        }

        if let Ok(size) = std::env::var("MAX_PAGE_SIZE") {
            config.max_page_size = size.trim().parse().map_err(|_| {
                CreditError::Configuration(format!("MAX_PAGE_SIZE is not a number: {size:?}"))
            })?;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.denominations()?;

        if self.max_page_size == 0 {
            return Err(CreditError::Configuration(
                "Max page size cannot be 0".to_string(),
            ));
        }

        if self.lock_cleanup_interval.is_zero() {
            return Err(CreditError::Configuration(
                "Lock cleanup interval cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the denomination allow-list.
    pub fn denominations(&self) -> Result<DenominationSet> {
        DenominationSet::new(self.sale_denominations.iter().copied())
    }
}

/// Parse a comma separated list of amounts.
pub fn parse_denominations(list: &str) -> Result<Vec<Decimal>> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            Decimal::from_str(item).map_err(|_| {
                CreditError::Configuration(format!("invalid sale denomination {item:?}"))
            })
        })
        .collect()
}
