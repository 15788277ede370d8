//! Centralized error handling for the PledgeVault core
//!
//! One typed error enum covers every core operation, with a stable code
//! string and a retryability classifier for upstream callers.

use thiserror::Error;

use crate::anchor::AnchorError;

/// Core operation error
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input; never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A balance-sheet invariant would be broken. Fatal, fail-closed;
    /// the operation is rejected rather than clamped.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The entity is not in a status that permits the requested transition.
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// Business rejection: the limit cannot cover the requested amount.
    #[error("Insufficient available credit: available {available}, requested {requested}")]
    InsufficientAvailable { available: i64, requested: i64 },

    /// Business rejection: the offered repayment does not cover the loan.
    #[error("Insufficient repayment: required {required}, offered {offered}")]
    InsufficientRepayment { required: i64, offered: i64 },

    /// Chain submission or confirmation failed with no local state change.
    /// Retryable.
    #[error("Chain anchor failure: {0}")]
    Anchor(#[from] AnchorError),

    /// A concurrent modification won; the caller must re-read and retry.
    #[error("Stale state: {0}")]
    StaleState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            CoreError::StateConflict(_) => "STATE_CONFLICT",
            CoreError::InsufficientAvailable { .. } => "INSUFFICIENT_AVAILABLE",
            CoreError::InsufficientRepayment { .. } => "INSUFFICIENT_REPAYMENT",
            CoreError::Anchor(_) => "ANCHOR_FAILURE",
            CoreError::StaleState(_) => "STALE_STATE",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Anchor failures leave no local state behind; stale state asks the
    /// caller to re-read first but the operation itself remains valid.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Anchor(_) | CoreError::StaleState(_) | CoreError::Database(_)
        )
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(err: validator::ValidationErrors) -> Self {
        CoreError::Validation(err.to_string())
    }
}

/// Result type alias using CoreError
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::Validation("x".to_string()).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            CoreError::InsufficientAvailable {
                available: 1,
                requested: 2
            }
            .code(),
            "INSUFFICIENT_AVAILABLE"
        );
        assert_eq!(
            CoreError::StaleState("x".to_string()).code(),
            "STALE_STATE"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(CoreError::Anchor(AnchorError::Timeout("t".to_string())).is_retryable());
        assert!(CoreError::StaleState("x".to_string()).is_retryable());
        assert!(!CoreError::Validation("x".to_string()).is_retryable());
        assert!(!CoreError::InvariantViolation("x".to_string()).is_retryable());
        assert!(!CoreError::InsufficientRepayment {
            required: 2,
            offered: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_insufficient_available_message_carries_amounts() {
        let err = CoreError::InsufficientAvailable {
            available: 200_000,
            requested: 500_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("200000"));
        assert!(msg.contains("500000"));
    }
}
