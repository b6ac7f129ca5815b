//! Access evaluation
//!
//! Pure derivation of "may this owner use the product right now" from an
//! entitlement record, plus at most one inherited owner record. Trial expiry
//! is derived here at read time and never persisted, which avoids racing a
//! cron-style expiry sweep against concurrent webhook writes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use impactline_shared::{OwnerId, SubscriptionStatus};

use crate::error::EntitlementResult;
use crate::record::EntitlementRecord;
use crate::store::EntitlementStore;

/// Days of continued access after a subscription enters `past_due`.
///
/// Pinned policy: grant a short grace window anchored at `past_due_since`,
/// then deny, instead of an abrupt lockout on the first failed payment.
pub const PAST_DUE_GRACE_DAYS: i64 = 3;

/// Single-hop team inheritance: a member's access decision can fall back to
/// exactly one owning account. The core never walks further.
#[async_trait]
pub trait InheritanceLookup: Send + Sync {
    async fn owner_for_inheritance(&self, owner_id: OwnerId)
        -> EntitlementResult<Option<OwnerId>>;
}

/// Reads the accounts service's team membership table.
#[derive(Clone)]
pub struct PgInheritanceLookup {
    pool: PgPool,
}

impl PgInheritanceLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InheritanceLookup for PgInheritanceLookup {
    async fn owner_for_inheritance(
        &self,
        owner_id: OwnerId,
    ) -> EntitlementResult<Option<OwnerId>> {
        let row: Option<(OwnerId,)> =
            sqlx::query_as("SELECT team_owner_id FROM team_members WHERE member_owner_id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }
}

/// Human-facing reason behind an access decision; drives UI messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    TrialActive,
    Active,
    TrialExpired,
    PastDue,
    Cancelled,
    None,
    Inherited,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessDecision {
    pub has_access: bool,
    pub reason: AccessReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<EntitlementRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_trial_days: Option<i64>,
}

impl AccessDecision {
    fn denied(reason: AccessReason, subscription: Option<EntitlementRecord>) -> Self {
        Self {
            has_access: false,
            reason,
            subscription,
            remaining_trial_days: None,
        }
    }
}

pub struct AccessEvaluator<S, L> {
    store: Arc<S>,
    inheritance: Arc<L>,
}

impl<S: EntitlementStore, L: InheritanceLookup> AccessEvaluator<S, L> {
    pub fn new(store: Arc<S>, inheritance: Arc<L>) -> Self {
        Self { store, inheritance }
    }

    /// Evaluate an owner's access. No side effects; expired trials are an
    /// interpretation of the stored record, never a write.
    pub async fn evaluate(&self, owner_id: OwnerId) -> EntitlementResult<AccessDecision> {
        let now = OffsetDateTime::now_utc();
        let own = match self.store.get(owner_id).await? {
            Some(record) => evaluate_record(&record, now),
            None => AccessDecision::denied(AccessReason::None, None),
        };
        if own.has_access {
            return Ok(own);
        }

        // Inherited path, one hop deep. A lookup failure is treated as "no
        // inheritance" so the owner's own evaluation still stands.
        match self.inheritance.owner_for_inheritance(owner_id).await {
            Ok(Some(team_owner)) if team_owner != owner_id => {
                if let Some(team_record) = self.store.get(team_owner).await? {
                    if evaluate_record(&team_record, now).has_access {
                        return Ok(AccessDecision {
                            has_access: true,
                            reason: AccessReason::Inherited,
                            subscription: own.subscription,
                            remaining_trial_days: None,
                        });
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    owner_id = %owner_id,
                    error = %e,
                    "Inheritance lookup failed, evaluating owner record only"
                );
            }
        }

        Ok(own)
    }
}

/// Pure record evaluation at a given instant.
pub fn evaluate_record(record: &EntitlementRecord, now: OffsetDateTime) -> AccessDecision {
    match record.status {
        SubscriptionStatus::None => AccessDecision::denied(AccessReason::None, Some(record.clone())),

        SubscriptionStatus::Trial => {
            let ends_at = match record.trial_ends_at {
                Some(ends_at) => ends_at,
                // Trial with no end date is malformed; fail closed.
                None => {
                    return AccessDecision::denied(AccessReason::Error, Some(record.clone()));
                }
            };
            if now > ends_at {
                // Derived expiry: reported, not persisted.
                AccessDecision {
                    has_access: false,
                    reason: AccessReason::TrialExpired,
                    subscription: Some(record.clone()),
                    remaining_trial_days: Some(0),
                }
            } else {
                AccessDecision {
                    has_access: true,
                    reason: AccessReason::TrialActive,
                    subscription: Some(record.clone()),
                    remaining_trial_days: Some(remaining_days(ends_at, now)),
                }
            }
        }

        SubscriptionStatus::Active => {
            // Pinned policy: a scheduled cancellation keeps access until the
            // paid period actually ends.
            if record.cancel_at_period_end {
                if let Some(period_end) = record.current_period_end {
                    if now > period_end {
                        return AccessDecision::denied(
                            AccessReason::Cancelled,
                            Some(record.clone()),
                        );
                    }
                }
            }
            AccessDecision {
                has_access: true,
                reason: AccessReason::Active,
                subscription: Some(record.clone()),
                remaining_trial_days: None,
            }
        }

        SubscriptionStatus::PastDue => {
            let anchor = record.past_due_since.unwrap_or(record.updated_at);
            let within_grace = now <= anchor + time::Duration::days(PAST_DUE_GRACE_DAYS);
            AccessDecision {
                has_access: within_grace,
                reason: AccessReason::PastDue,
                subscription: Some(record.clone()),
                remaining_trial_days: None,
            }
        }

        SubscriptionStatus::Cancelled => {
            AccessDecision::denied(AccessReason::Cancelled, Some(record.clone()))
        }

        // Never stored by this core; tolerated if it appears.
        SubscriptionStatus::Expired => AccessDecision {
            has_access: false,
            reason: AccessReason::TrialExpired,
            subscription: Some(record.clone()),
            remaining_trial_days: Some(0),
        },
    }
}

/// Whole days remaining, rounded up, never negative.
fn remaining_days(ends_at: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (ends_at - now).whole_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + 86_399) / 86_400
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::trial::TrialActivator;
    use std::collections::HashMap;
    use time::Duration;

    struct StaticInheritance(HashMap<OwnerId, OwnerId>);

    #[async_trait]
    impl InheritanceLookup for StaticInheritance {
        async fn owner_for_inheritance(
            &self,
            owner_id: OwnerId,
        ) -> EntitlementResult<Option<OwnerId>> {
            Ok(self.0.get(&owner_id).copied())
        }
    }

    struct NoInheritance;

    #[async_trait]
    impl InheritanceLookup for NoInheritance {
        async fn owner_for_inheritance(&self, _: OwnerId) -> EntitlementResult<Option<OwnerId>> {
            Ok(None)
        }
    }

    struct FailingInheritance;

    #[async_trait]
    impl InheritanceLookup for FailingInheritance {
        async fn owner_for_inheritance(&self, _: OwnerId) -> EntitlementResult<Option<OwnerId>> {
            Err(crate::error::EntitlementError::Database(
                "membership service unreachable".into(),
            ))
        }
    }

    fn trial_record(owner: OwnerId, ends_in: Duration) -> EntitlementRecord {
        let now = OffsetDateTime::now_utc();
        let mut record = EntitlementRecord::new_default(owner);
        record.status = SubscriptionStatus::Trial;
        record.trial_started_at = Some(now - Duration::days(1));
        record.trial_ends_at = Some(now + ends_in);
        record
    }

    #[tokio::test]
    async fn test_fresh_trial_grants_thirty_days() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::new();
        TrialActivator::new(store.clone())
            .start_trial(owner)
            .await
            .unwrap();

        let evaluator = AccessEvaluator::new(store, Arc::new(NoInheritance));
        let decision = evaluator.evaluate(owner).await.unwrap();
        assert!(decision.has_access);
        assert_eq!(decision.reason, AccessReason::TrialActive);
        assert_eq!(decision.remaining_trial_days, Some(30));
    }

    #[tokio::test]
    async fn test_expired_trial_is_derived_without_a_write() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::new();
        store.seed_record(trial_record(owner, Duration::days(-2)));
        let before = store.get(owner).await.unwrap().unwrap();

        let evaluator = AccessEvaluator::new(store.clone(), Arc::new(NoInheritance));
        let decision = evaluator.evaluate(owner).await.unwrap();
        assert!(!decision.has_access);
        assert_eq!(decision.reason, AccessReason::TrialExpired);
        assert_eq!(decision.remaining_trial_days, Some(0));

        // Nothing was persisted: same version, same stored status.
        let after = store.get(owner).await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.status, SubscriptionStatus::Trial);
    }

    #[tokio::test]
    async fn test_missing_record_evaluates_as_none() {
        let store = Arc::new(InMemoryStore::new());
        let evaluator = AccessEvaluator::new(store, Arc::new(NoInheritance));
        let decision = evaluator.evaluate(OwnerId::new()).await.unwrap();
        assert!(!decision.has_access);
        assert_eq!(decision.reason, AccessReason::None);
    }

    #[test]
    fn test_past_due_grace_window() {
        let owner = OwnerId::new();
        let now = OffsetDateTime::now_utc();
        let mut record = EntitlementRecord::new_default(owner);
        record.status = SubscriptionStatus::PastDue;

        record.past_due_since = Some(now - Duration::days(1));
        let in_grace = evaluate_record(&record, now);
        assert!(in_grace.has_access);
        assert_eq!(in_grace.reason, AccessReason::PastDue);

        record.past_due_since = Some(now - Duration::days(PAST_DUE_GRACE_DAYS + 1));
        let past_grace = evaluate_record(&record, now);
        assert!(!past_grace.has_access);
        assert_eq!(past_grace.reason, AccessReason::PastDue);
    }

    #[test]
    fn test_scheduled_cancellation_grants_until_period_end() {
        let owner = OwnerId::new();
        let now = OffsetDateTime::now_utc();
        let mut record = EntitlementRecord::new_default(owner);
        record.status = SubscriptionStatus::Active;
        record.cancel_at_period_end = true;

        record.current_period_end = Some(now + Duration::days(10));
        let before_end = evaluate_record(&record, now);
        assert!(before_end.has_access);
        assert_eq!(before_end.reason, AccessReason::Active);

        record.current_period_end = Some(now - Duration::hours(1));
        let after_end = evaluate_record(&record, now);
        assert!(!after_end.has_access);
        assert_eq!(after_end.reason, AccessReason::Cancelled);
    }

    #[tokio::test]
    async fn test_member_inherits_team_owner_access_one_hop() {
        let store = Arc::new(InMemoryStore::new());
        let team_owner = OwnerId::new();
        let member = OwnerId::new();
        store.seed_record(trial_record(team_owner, Duration::days(5)));

        let mut links = HashMap::new();
        links.insert(member, team_owner);
        let evaluator = AccessEvaluator::new(store, Arc::new(StaticInheritance(links)));

        let decision = evaluator.evaluate(member).await.unwrap();
        assert!(decision.has_access);
        assert_eq!(decision.reason, AccessReason::Inherited);
    }

    #[tokio::test]
    async fn test_inheritance_is_not_transitive() {
        // c -> b -> a: b has no record of its own, so c gets nothing even
        // though a's trial is live.
        let store = Arc::new(InMemoryStore::new());
        let a = OwnerId::new();
        let b = OwnerId::new();
        let c = OwnerId::new();
        store.seed_record(trial_record(a, Duration::days(5)));

        let mut links = HashMap::new();
        links.insert(b, a);
        links.insert(c, b);
        let evaluator = AccessEvaluator::new(store, Arc::new(StaticInheritance(links)));

        assert!(evaluator.evaluate(b).await.unwrap().has_access);
        assert!(!evaluator.evaluate(c).await.unwrap().has_access);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back_to_own_record() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::new();
        store.seed_record(trial_record(owner, Duration::days(5)));

        let evaluator = AccessEvaluator::new(store.clone(), Arc::new(FailingInheritance));
        let decision = evaluator.evaluate(owner).await.unwrap();
        assert!(decision.has_access);
        assert_eq!(decision.reason, AccessReason::TrialActive);

        // And an owner with nothing of their own is denied, not errored.
        let denied = evaluator.evaluate(OwnerId::new()).await.unwrap();
        assert!(!denied.has_access);
        assert_eq!(denied.reason, AccessReason::None);
    }
}
