//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use impactline_entitlement::EntitlementError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Precondition errors
    #[error("Trial already used or subscription active (status: {0})")]
    TrialAlreadyUsed(String),
    #[error("Not eligible in current status: {0}")]
    NotEligible(String),

    // Access code errors
    #[error("Invalid access code")]
    CodeInvalid,
    #[error("Access code expired")]
    CodeExpired,
    #[error("Access code redemption limit reached")]
    CodeCapExceeded,
    #[error("Access code already redeemed")]
    AlreadyRedeemed,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),

            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::InvalidSignature => {
                (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string())
            }

            ApiError::TrialAlreadyUsed(_) => {
                (StatusCode::CONFLICT, "TRIAL_ALREADY_USED", self.to_string())
            }
            ApiError::NotEligible(_) => (StatusCode::CONFLICT, "NOT_ELIGIBLE", self.to_string()),

            ApiError::CodeInvalid => (StatusCode::BAD_REQUEST, "CODE_INVALID", self.to_string()),
            ApiError::CodeExpired => (StatusCode::BAD_REQUEST, "CODE_EXPIRED", self.to_string()),
            ApiError::CodeCapExceeded => {
                (StatusCode::CONFLICT, "CODE_CAP_EXCEEDED", self.to_string())
            }
            ApiError::AlreadyRedeemed => {
                (StatusCode::CONFLICT, "ALREADY_REDEEMED", self.to_string())
            }

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<EntitlementError> for ApiError {
    fn from(err: EntitlementError) -> Self {
        match err {
            EntitlementError::Validation(msg) => ApiError::Validation(msg),
            EntitlementError::SignatureInvalid => ApiError::InvalidSignature,
            EntitlementError::AlreadyUsedOrActive { status } => {
                ApiError::TrialAlreadyUsed(status.to_string())
            }
            EntitlementError::NotEligible { status } => ApiError::NotEligible(status.to_string()),
            EntitlementError::CodeInvalid => ApiError::CodeInvalid,
            EntitlementError::CodeExpired => ApiError::CodeExpired,
            EntitlementError::CodeCapExceeded => ApiError::CodeCapExceeded,
            EntitlementError::AlreadyRedeemed => ApiError::AlreadyRedeemed,
            // Version conflicts are retried inside the core; one escaping here
            // means retries were exhausted, same as any transient failure.
            EntitlementError::VersionConflict(_) | EntitlementError::Transient(_) => {
                ApiError::ServiceUnavailable
            }
            EntitlementError::Database(msg) => ApiError::Database(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::Database(err.to_string())
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use impactline_shared::SubscriptionStatus;

    #[test]
    fn test_taxonomy_maps_to_expected_statuses() {
        let cases = [
            (
                ApiError::from(EntitlementError::Validation("bad".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(EntitlementError::SignatureInvalid),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(EntitlementError::AlreadyUsedOrActive {
                    status: SubscriptionStatus::Trial,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(EntitlementError::CodeInvalid),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(EntitlementError::CodeCapExceeded),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(EntitlementError::Transient("exhausted".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(EntitlementError::Database("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
