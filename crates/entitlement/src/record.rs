//! Entitlement record data model
//!
//! One record per account-owning entity. The record is exclusively owned and
//! mutated by this crate; everything else reads it through the access
//! evaluator or usage gate.

use impactline_shared::{OwnerId, PlanTier, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Durable subscription state for one owner.
///
/// All writes go through `compare_and_swap` guarded by `version`; `updated_at`
/// doubles as the fence for out-of-order webhook application.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntitlementRecord {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub status: SubscriptionStatus,
    pub plan_tier: PlanTier,
    pub trial_started_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub billing_customer_ref: Option<String>,
    pub billing_subscription_ref: Option<String>,
    pub billing_price_ref: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<OffsetDateTime>,
    /// Set when the record enters `past_due`, cleared on return to `active`.
    /// Anchors the payment-failure grace window.
    pub past_due_since: Option<OffsetDateTime>,
    /// Cap on initiatives implied by `plan_tier`; `None` means unlimited.
    pub resource_limit: Option<i32>,
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

impl EntitlementRecord {
    /// Fresh record for an owner that has never started a trial or paid.
    pub fn new_default(owner_id: OwnerId) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            status: SubscriptionStatus::None,
            plan_tier: PlanTier::None,
            trial_started_at: None,
            trial_ends_at: None,
            billing_customer_ref: None,
            billing_subscription_ref: None,
            billing_price_ref: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            past_due_since: None,
            resource_limit: None,
            version: 1,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}
