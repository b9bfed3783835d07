//! Fixed-point money helpers.
//!
//! Balances and amounts are stored as decimals with two fractional digits and
//! at most ten significant digits in total.

use rust_decimal::Decimal;

/// Fractional digits kept for every stored amount.
pub const AMOUNT_DECIMAL_PLACES: u32 = 2;

/// Total significant digits a stored amount may carry.
pub const AMOUNT_MAX_DIGITS: u32 = 10;

/// Largest value representable with the storage precision (99,999,999.99).
pub fn max_amount() -> Decimal {
    Decimal::new(9_999_999_999, AMOUNT_DECIMAL_PLACES)
}

/// Check whether a value can be stored without losing precision.
pub fn fits_fixed_point(value: Decimal) -> bool {
    value.normalize().scale() <= AMOUNT_DECIMAL_PLACES && value.abs() <= max_amount()
}

/// Rescale a value to the storage precision.
///
/// Callers validate with [`fits_fixed_point`] first; values with more
/// fractional digits are rounded half-even.
pub fn to_fixed_point(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp(AMOUNT_DECIMAL_PLACES);
    rounded.rescale(AMOUNT_DECIMAL_PLACES);
    rounded
}

/// Direction of a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Balance increases.
    Credit,
    /// Balance decreases.
    Debit,
}

impl Direction {
    /// Direction implied by a signed delta. Zero counts as a credit.
    pub fn of(delta: Decimal) -> Self {
        if delta.is_sign_negative() && !delta.is_zero() {
            Direction::Debit
        } else {
            Direction::Credit
        }
    }
}
