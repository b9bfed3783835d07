//! Seller Credit Service
//!
//! The inbound interface used by the outer shell: seller registration, the
//! sale flow, the deposit-request workflow and reporting reads. All balance
//! changes go through the ledger's balance mutator.

pub mod config;
pub mod metrics;
pub mod service;
pub mod state;

pub use config::ServiceConfig;
pub use metrics::{Metrics, MetricsSnapshot};
pub use service::{BatchApprovalOutcome, CreditService, DepositApproval, SaleReceipt, SellerProfile};
pub use state::ServiceState;
