//! Sale records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sellercredit_common::{SaleId, SellerId};

/// A balance-debiting sale to a customer phone number.
///
/// Created in the same unit of work as its balance decrease and SALE log
/// entry. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    /// Sale identifier.
    pub id: SaleId,
    /// Seller that made the sale.
    pub seller_id: SellerId,
    /// Amount charged, one of the allowed denominations.
    pub amount: Decimal,
    /// Customer phone number that was charged.
    pub phone_number: String,
    /// When the sale was created.
    pub created_at: DateTime<Utc>,
}

impl Sale {
    /// Create a new sale record.
    pub fn new(seller_id: SellerId, amount: Decimal, phone_number: impl Into<String>) -> Self {
        Self {
            id: SaleId::new(),
            seller_id,
            amount,
            phone_number: phone_number.into(),
            created_at: Utc::now(),
        }
    }
}
