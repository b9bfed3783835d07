//! Identifier types for seller-credit entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// All identifiers use UUID v7 so that ids sort by creation time.
macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new, time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_identifier!(
    /// Identity of the user account a seller is linked to.
    UserId
);

uuid_identifier!(
    /// Unique identifier for a seller.
    SellerId
);

uuid_identifier!(
    /// Unique identifier for a seller's credit record.
    CreditId
);

uuid_identifier!(
    /// Unique identifier for a sale.
    SaleId
);

uuid_identifier!(
    /// Unique identifier for a deposit request.
    DepositId
);

/// Identifier of a transaction log entry.
///
/// Assigned by the store from a monotonically increasing sequence; gaps are
/// possible when a unit of work rolls back after reserving an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId(i64);

impl LogId {
    /// Wrap a raw sequence value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw sequence value.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
