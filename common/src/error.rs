//! Error types for seller-credit operations.

use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for seller-credit operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CreditError {
    /// A debit would drive the balance below zero.
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    /// Amount outside the allowed set or range.
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: String },

    /// A non-amount input failed validation.
    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    /// Referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Exclusive access could not be obtained in time.
    #[error("Timed out waiting for {0}")]
    ConflictTimeout(String),

    /// Deposit request state machine violation.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Persistence failure; the unit of work was rolled back.
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Service is not accepting requests.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Coarse classification used by callers to pick a response class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller sent something invalid (validation-style rejection).
    Client,
    /// Referenced entity is missing.
    NotFound,
    /// Retrying later may succeed.
    Transient,
    /// Server-side fault.
    Server,
}

impl CreditError {
    /// Build a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CreditError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Build an `InvalidField` error.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        CreditError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build an `InvalidAmount` error.
    pub fn invalid_amount(amount: Decimal, reason: impl Into<String>) -> Self {
        CreditError::InvalidAmount {
            amount,
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CreditError::ConflictTimeout(_) | CreditError::ServiceUnavailable(_)
        )
    }

    /// Get error code for responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            CreditError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CreditError::InvalidAmount { .. } => "INVALID_AMOUNT",
            CreditError::InvalidField { .. } => "INVALID_FIELD",
            CreditError::NotFound { .. } => "NOT_FOUND",
            CreditError::ConflictTimeout(_) => "CONFLICT_TIMEOUT",
            CreditError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CreditError::StorageFailure(_) => "STORAGE_FAILURE",
            CreditError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            CreditError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Classify for the calling shell.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            CreditError::InsufficientBalance { .. }
            | CreditError::InvalidAmount { .. }
            | CreditError::InvalidField { .. }
            | CreditError::InvalidTransition { .. } => ErrorClass::Client,
            CreditError::NotFound { .. } => ErrorClass::NotFound,
            CreditError::ConflictTimeout(_) | CreditError::ServiceUnavailable(_) => {
                ErrorClass::Transient
            }
            CreditError::StorageFailure(_) | CreditError::Configuration(_) => ErrorClass::Server,
        }
    }
}

/// Result type alias for seller-credit operations.
pub type Result<T> = std::result::Result<T, CreditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(CreditError::ConflictTimeout("credit lock".into()).is_retryable());
        assert!(!CreditError::StorageFailure("disk".into()).is_retryable());
        assert!(!CreditError::InsufficientBalance {
            required: Decimal::from(1000),
            available: Decimal::ZERO,
        }
        .is_retryable());
    }

    #[test]
    fn test_error_class() {
        let insufficient = CreditError::InsufficientBalance {
            required: Decimal::from(1000),
            available: Decimal::ZERO,
        };
        assert_eq!(insufficient.error_class(), ErrorClass::Client);
        assert_eq!(insufficient.error_code(), "INSUFFICIENT_BALANCE");
        assert_eq!(
            CreditError::not_found("credit", "x").error_class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            CreditError::StorageFailure("x".into()).error_class(),
            ErrorClass::Server
        );
    }

    #[test]
    fn test_display() {
        let err = CreditError::not_found("sale", 42);
        assert_eq!(err.to_string(), "sale not found: 42");
    }
}
