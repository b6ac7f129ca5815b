//! Entitlement error types

use impactline_shared::SubscriptionStatus;
use thiserror::Error;

/// Entitlement-specific errors
///
/// Precondition failures carry the current status so callers can render a
/// precise message (trial already active / subscription active / payment
/// issue / already cancelled).
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Trial already used or subscription present (status: {status})")]
    AlreadyUsedOrActive { status: SubscriptionStatus },

    #[error("Not eligible for code redemption (status: {status})")]
    NotEligible { status: SubscriptionStatus },

    #[error("Access code not found")]
    CodeInvalid,

    #[error("Access code expired")]
    CodeExpired,

    #[error("Access code redemption limit reached")]
    CodeCapExceeded,

    #[error("Access code already redeemed by this owner")]
    AlreadyRedeemed,

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Concurrent modification detected: {0}")]
    VersionConflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl EntitlementError {
    /// Whether a compare-and-swap caller should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }

    /// Whether the caller should surface this as a 5xx so the billing
    /// provider redelivers the event later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Database(_))
    }
}

impl From<sqlx::Error> for EntitlementError {
    fn from(err: sqlx::Error) -> Self {
        EntitlementError::Database(err.to_string())
    }
}

pub type EntitlementResult<T> = Result<T, EntitlementError>;
