//! Ledger configuration.

use std::time::Duration;

use sellercredit_common::{CreditError, Result};

/// Bounds on lock waits and unit-of-work duration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Maximum time to wait for a seller's credit lock.
    pub lock_timeout: Duration,
    /// Maximum time a whole unit of work may take, lock hold included.
    pub unit_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            unit_timeout: Duration::from_secs(10),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_millis("LEDGER_LOCK_TIMEOUT_MS") {
            config.lock_timeout = ms;
        }

        if let Some(ms) = env_millis("LEDGER_UNIT_TIMEOUT_MS") {
            config.unit_timeout = ms;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(CreditError::Configuration(
                "Lock timeout cannot be zero".to_string(),
            ));
        }

        if self.unit_timeout.is_zero() {
            return Err(CreditError::Configuration(
                "Unit timeout cannot be zero".to_string(),
            ));
        }

        if self.lock_timeout > self.unit_timeout {
            return Err(CreditError::Configuration(
                "Lock timeout cannot exceed unit timeout".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
