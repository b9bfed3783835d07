//! Immutable transaction log entries.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sellercredit_common::{CreditError, CreditId, LogId};

/// Kind of balance change a log entry documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    /// Approved deposit; increases the balance.
    Deposit,
    /// Sale; decreases the balance.
    Sale,
}

impl LogType {
    /// Storage code for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Deposit => "DEPOSIT",
            LogType::Sale => "SALE",
        }
    }

    /// Apply this type's sign to a magnitude.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            LogType::Deposit => amount,
            LogType::Sale => -amount,
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogType {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(LogType::Deposit),
            "SALE" => Ok(LogType::Sale),
            other => Err(CreditError::StorageFailure(format!(
                "unknown transaction log type {other:?}"
            ))),
        }
    }
}

/// A single immutable record of a balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    /// Store-assigned sequence id.
    pub id: LogId,
    /// Credit this entry belongs to.
    pub credit_id: CreditId,
    /// Magnitude of the change, always positive.
    pub amount: Decimal,
    /// Entry type; carries the sign.
    pub log_type: LogType,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

/// Running totals over a set of log entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTotals {
    /// Sum of DEPOSIT amounts.
    pub deposits: Decimal,
    /// Sum of SALE amounts.
    pub sales: Decimal,
    /// Number of entries folded in.
    pub entries: u64,
}

impl LogTotals {
    /// Fold one entry into the totals.
    pub fn add(&mut self, entry: &TransactionLog) {
        match entry.log_type {
            LogType::Deposit => self.deposits += entry.amount,
            LogType::Sale => self.sales += entry.amount,
        }
        self.entries += 1;
    }

    /// Deposits minus sales; equals the balance for a consistent credit.
    pub fn net(&self) -> Decimal {
        self.deposits - self.sales
    }
}

impl<'a> FromIterator<&'a TransactionLog> for LogTotals {
    fn from_iter<I: IntoIterator<Item = &'a TransactionLog>>(iter: I) -> Self {
        let mut totals = LogTotals::default();
        for entry in iter {
            totals.add(entry);
        }
        totals
    }
}
