//! SellerCredit Common Types
//!
//! Shared types used across the seller-credit crates: identifiers,
//! fixed-point money helpers and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
