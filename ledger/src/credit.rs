//! Seller credit balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sellercredit_common::{
    fits_fixed_point, to_fixed_point, CreditError, CreditId, Result, SellerId,
};

/// A seller's spendable balance. Exactly one per seller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    /// Credit identifier.
    pub id: CreditId,
    /// Owning seller.
    pub seller_id: SellerId,
    /// Current balance, never negative.
    pub balance: Decimal,
    /// When the credit was created.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl Credit {
    /// Create a zero balance for a freshly registered seller.
    pub fn zero(seller_id: SellerId) -> Self {
        let now = Utc::now();
        Self {
            id: CreditId::new(),
            seller_id,
            balance: to_fixed_point(Decimal::ZERO),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the balance covers a debit of `amount`.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Balance after applying a signed delta, without mutating.
    pub fn projected(&self, delta: Decimal) -> Decimal {
        self.balance + delta
    }

    /// Apply a signed delta in place.
    ///
    /// Fails with `InsufficientBalance` when a debit would leave the balance
    /// negative and with `InvalidAmount` when the result exceeds the storage
    /// precision; the credit is untouched in both cases.
    pub fn apply(&mut self, delta: Decimal) -> Result<Decimal> {
        let next = self.projected(delta);
        if delta.is_sign_negative() && next.is_sign_negative() && !next.is_zero() {
            return Err(CreditError::InsufficientBalance {
                required: delta.abs(),
                available: self.balance,
            });
        }
        if !fits_fixed_point(next) {
            return Err(CreditError::invalid_amount(
                delta,
                format!("resulting balance {next} exceeds the storable maximum"),
            ));
        }

        self.balance = to_fixed_point(next);
        self.updated_at = Utc::now();
        Ok(self.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_zero_credit() {
        let credit = Credit::zero(SellerId::new());
        assert_eq!(credit.balance, Decimal::ZERO);
        assert!(credit.has_sufficient_funds(Decimal::ZERO));
        assert!(!credit.has_sufficient_funds(dec!(0.01)));
    }

    #[test]
    fn test_apply_debit_to_zero() {
        let mut credit = Credit::zero(SellerId::new());
        credit.apply(dec!(1000)).unwrap();
        assert_eq!(credit.apply(dec!(-1000)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_apply_overdraft_leaves_balance() {
        let mut credit = Credit::zero(SellerId::new());
        credit.apply(dec!(500)).unwrap();

        let err = credit.apply(dec!(-1000)).unwrap_err();
        assert_eq!(
            err,
            CreditError::InsufficientBalance {
                required: dec!(1000),
                available: dec!(500),
            }
        );
        assert_eq!(credit.balance, dec!(500));
    }

    #[test]
    fn test_apply_past_max_balance_rejected() {
        let mut credit = Credit::zero(SellerId::new());
        credit.apply(dec!(99999999.99)).unwrap();

        let err = credit.apply(dec!(1)).unwrap_err();
        assert!(matches!(err, CreditError::InvalidAmount { .. }));
        assert_eq!(credit.balance, dec!(99999999.99));
    }
}
