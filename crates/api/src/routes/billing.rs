//! Owner-facing billing routes

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use impactline_entitlement::{
    AccessCodeRegistry, AccessDecision, AccessEvaluator, AccessReason, TrialActivator, UsageGate,
};

use crate::{auth::AuthOwner, error::ApiError, state::AppState};

/// Subscription info returned from trial start and code redemption
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: String,
    pub plan_tier: String,
    pub trial_started_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_granted: Option<i32>,
}

impl SubscriptionInfo {
    fn from_record(record: &impactline_entitlement::EntitlementRecord) -> Self {
        Self {
            status: record.status.to_string(),
            plan_tier: record.plan_tier.to_string(),
            trial_started_at: record.trial_started_at,
            trial_ends_at: record.trial_ends_at,
            days_granted: None,
        }
    }
}

/// Get the caller's current access decision.
///
/// Always 200 for a resolvable caller; a storage failure is reported as a
/// denied decision with reason `error` and 503, never a granted one.
pub async fn get_status(
    State(state): State<AppState>,
    AuthOwner(owner_id): AuthOwner,
) -> (StatusCode, Json<AccessDecision>) {
    let evaluator = AccessEvaluator::new(state.store.clone(), state.inheritance.clone());

    match evaluator.evaluate(owner_id).await {
        Ok(decision) => (StatusCode::OK, Json(decision)),
        Err(e) => {
            tracing::error!(owner_id = %owner_id, error = %e, "Access evaluation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(AccessDecision {
                    has_access: false,
                    reason: AccessReason::Error,
                    subscription: None,
                    remaining_trial_days: None,
                }),
            )
        }
    }
}

/// Start the caller's one-shot free trial
pub async fn start_trial(
    State(state): State<AppState>,
    AuthOwner(owner_id): AuthOwner,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let record = TrialActivator::new(state.store.clone())
        .start_trial(owner_id)
        .await?;
    Ok(Json(SubscriptionInfo::from_record(&record)))
}

/// Request to redeem an access code
#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

/// Redeem an access code for bonus trial days
pub async fn redeem_code(
    State(state): State<AppState>,
    AuthOwner(owner_id): AuthOwner,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let redemption = AccessCodeRegistry::new(state.store.clone())
        .redeem(owner_id, &req.code)
        .await?;

    let mut info = SubscriptionInfo::from_record(&redemption.record);
    info.days_granted = Some(redemption.days_granted);
    Ok(Json(info))
}

/// Query for a usage check; the caller reports its live resource count
#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub current_count: i64,
}

/// Check the caller's resource count against their plan limit
pub async fn check_usage(
    State(state): State<AppState>,
    AuthOwner(owner_id): AuthOwner,
    Query(query): Query<UsageQuery>,
) -> Result<Json<impactline_entitlement::UsageCheck>, ApiError> {
    if query.current_count < 0 {
        return Err(ApiError::Validation(
            "current_count must be non-negative".to_string(),
        ));
    }

    let check = UsageGate::new(state.store.clone())
        .check(owner_id, query.current_count)
        .await?;
    Ok(Json(check))
}
