//! Request validation applied before a mutation.
//!
//! These checks reject obviously bad requests early. The sufficiency
//! pre-check reads a snapshot and is advisory only; the authoritative check
//! runs again under the credit lock inside the balance mutator.

use std::collections::BTreeSet;

use rust_decimal::Decimal;

use sellercredit_common::{fits_fixed_point, to_fixed_point, CreditError, Result};

use crate::credit::Credit;

/// Minimum and maximum phone number length, including a leading `+`.
pub const PHONE_NUMBER_LEN: std::ops::RangeInclusive<usize> = 10..=15;

/// Fixed set of amounts a sale may charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenominationSet {
    allowed: BTreeSet<Decimal>,
}

impl DenominationSet {
    /// Build a set from amounts. Every amount must be positive and storable.
    pub fn new(amounts: impl IntoIterator<Item = Decimal>) -> Result<Self> {
        let mut allowed = BTreeSet::new();
        for amount in amounts {
            if amount <= Decimal::ZERO || !fits_fixed_point(amount) {
                return Err(CreditError::Configuration(format!(
                    "invalid sale denomination {amount}"
                )));
            }
            allowed.insert(amount.normalize());
        }

        if allowed.is_empty() {
            return Err(CreditError::Configuration(
                "sale denomination set cannot be empty".to_string(),
            ));
        }

        Ok(Self { allowed })
    }

    /// Check that `amount` is one of the allowed denominations.
    pub fn validate(&self, amount: Decimal) -> Result<Decimal> {
        if self.allowed.contains(&amount.normalize()) {
            Ok(to_fixed_point(amount))
        } else {
            Err(CreditError::invalid_amount(
                amount,
                format!("must be one of {}", self.describe()),
            ))
        }
    }

    /// Allowed amounts in ascending order.
    pub fn amounts(&self) -> impl Iterator<Item = &Decimal> {
        self.allowed.iter()
    }

    fn describe(&self) -> String {
        self.allowed
            .iter()
            .map(|amount| amount.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for DenominationSet {
    fn default() -> Self {
        Self {
            allowed: [1000, 2000, 5000, 10_000, 20_000, 50_000]
                .into_iter()
                .map(Decimal::from)
                .collect(),
        }
    }
}

/// Validate a deposit request amount: positive and storable.
pub fn validate_deposit_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(CreditError::invalid_amount(amount, "must be positive"));
    }
    if !fits_fixed_point(amount) {
        return Err(CreditError::invalid_amount(
            amount,
            "at most two decimal places and ten digits",
        ));
    }
    Ok(to_fixed_point(amount))
}

/// Validate and normalize a customer phone number.
///
/// Accepts digits with an optional leading `+`; surrounding whitespace is
/// trimmed.
pub fn validate_phone_number(phone_number: &str) -> Result<String> {
    let trimmed = phone_number.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CreditError::invalid_field(
            "phone_number",
            "must contain only digits with an optional leading +",
        ));
    }

    if !PHONE_NUMBER_LEN.contains(&trimmed.len()) {
        return Err(CreditError::invalid_field(
            "phone_number",
            format!(
                "must be {} to {} characters",
                PHONE_NUMBER_LEN.start(),
                PHONE_NUMBER_LEN.end()
            ),
        ));
    }

    Ok(trimmed.to_string())
}

/// Fast-fail sufficiency check against a snapshot balance.
pub fn precheck_balance(snapshot: &Credit, amount: Decimal) -> Result<()> {
    if snapshot.has_sufficient_funds(amount) {
        Ok(())
    } else {
        Err(CreditError::InsufficientBalance {
            required: amount,
            available: snapshot.balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sellercredit_common::SellerId;

    #[test]
    fn test_default_denominations() {
        let set = DenominationSet::default();
        assert_eq!(set.validate(dec!(1000.00)).unwrap(), dec!(1000));
        assert!(set.validate(dec!(1500)).is_err());
        assert!(matches!(
            set.validate(dec!(-1000)),
            Err(CreditError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_custom_denominations() {
        let set = DenominationSet::new([dec!(250), dec!(500)]).unwrap();
        assert!(set.validate(dec!(250)).is_ok());
        assert!(set.validate(dec!(1000)).is_err());
        assert_eq!(set.amounts().count(), 2);

        assert!(DenominationSet::new(Vec::new()).is_err());
        assert!(DenominationSet::new([dec!(0)]).is_err());
        assert!(DenominationSet::new([dec!(1.001)]).is_err());
    }

    #[test]
    fn test_deposit_amount() {
        assert_eq!(validate_deposit_amount(dec!(1000)).unwrap().scale(), 2);
        assert!(validate_deposit_amount(dec!(0.01)).is_ok());
        assert!(validate_deposit_amount(Decimal::ZERO).is_err());
        assert!(validate_deposit_amount(dec!(-5)).is_err());
        assert!(validate_deposit_amount(dec!(1.234)).is_err());
        assert!(validate_deposit_amount(dec!(100000000)).is_err());
    }

    #[test]
    fn test_phone_number() {
        assert_eq!(validate_phone_number("09123456789").unwrap(), "09123456789");
        assert_eq!(
            validate_phone_number(" +989123456789 ").unwrap(),
            "+989123456789"
        );
        assert!(validate_phone_number("").is_err());
        assert!(validate_phone_number("0912-345-678").is_err());
        assert!(validate_phone_number("091234").is_err());
        assert!(validate_phone_number("0912345678901234").is_err());
    }

    #[test]
    fn test_precheck_balance() {
        let mut credit = Credit::zero(SellerId::new());
        assert!(matches!(
            precheck_balance(&credit, dec!(1000)),
            Err(CreditError::InsufficientBalance { .. })
        ));

        credit.apply(dec!(2000)).unwrap();
        assert!(precheck_balance(&credit, dec!(1000)).is_ok());
    }
}
