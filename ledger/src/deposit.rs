//! Deposit requests and their approval state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sellercredit_common::{CreditError, CreditId, DepositId, Result, SellerId};

/// Deposit request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    /// Submitted by the seller, awaiting review.
    Pending,
    /// Approved; the balance was credited.
    Approved,
    /// Rejected; no balance effect.
    Rejected,
}

impl DepositStatus {
    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[DepositStatus] {
        match self {
            DepositStatus::Pending => &[DepositStatus::Approved, DepositStatus::Rejected],
            DepositStatus::Approved => &[],
            DepositStatus::Rejected => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: DepositStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Storage code for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "PENDING",
            DepositStatus::Approved => "APPROVED",
            DepositStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = CreditError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DepositStatus::Pending),
            "APPROVED" => Ok(DepositStatus::Approved),
            "REJECTED" => Ok(DepositStatus::Rejected),
            other => Err(CreditError::StorageFailure(format!(
                "unknown deposit status {other:?}"
            ))),
        }
    }
}

/// A seller-submitted request to add funds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Request identifier.
    pub id: DepositId,
    /// Seller that submitted the request.
    pub seller_id: SellerId,
    /// Credit that will receive the funds.
    pub credit_id: CreditId,
    /// Requested amount.
    pub amount: Decimal,
    /// Current status.
    pub status: DepositStatus,
    /// When the request was submitted.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl DepositRequest {
    /// Create a pending request.
    pub fn new(seller_id: SellerId, credit_id: CreditId, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: DepositId::new(),
            seller_id,
            credit_id,
            amount,
            status: DepositStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status.
    pub fn transition_to(&mut self, next: DepositStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CreditError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
