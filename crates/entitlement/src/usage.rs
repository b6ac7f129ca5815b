//! Tier resource limits
//!
//! Answers "may this owner create one more resource" from the stored plan
//! tier. The caller supplies the current resource count; this module owns no
//! counting of its own.

use std::sync::Arc;

use serde::Serialize;

use impactline_shared::OwnerId;

use crate::error::EntitlementResult;
use crate::store::EntitlementStore;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageCheck {
    pub within_limit: bool,
    /// `None` means unlimited.
    pub limit: Option<i32>,
    pub used: i64,
}

pub struct UsageGate<S> {
    store: Arc<S>,
}

impl<S: EntitlementStore> UsageGate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Check whether `current_count` leaves room for one more resource.
    /// The stored `resource_limit` on the record is authoritative; it is
    /// refreshed from the tier on every transition that changes tier, so
    /// records written before a tier-table change keep the cap they were
    /// granted. Owners with no record are unlimited; limit enforcement is
    /// separate from access evaluation.
    pub async fn check(
        &self,
        owner_id: OwnerId,
        current_count: i64,
    ) -> EntitlementResult<UsageCheck> {
        let limit = match self.store.get(owner_id).await? {
            Some(record) => record.resource_limit,
            None => None,
        };

        Ok(UsageCheck {
            within_limit: limit.map_or(true, |l| current_count < i64::from(l)),
            limit,
            used: current_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntitlementRecord;
    use impactline_shared::{PlanTier, SubscriptionStatus};

    fn seeded(store: &InMemoryStore, tier: PlanTier) -> OwnerId {
        let owner = OwnerId::new();
        let mut record = EntitlementRecord::new_default(owner);
        record.status = SubscriptionStatus::Active;
        record.plan_tier = tier;
        record.resource_limit = tier.resource_limit();
        store.seed_record(record);
        owner
    }

    use crate::memory::InMemoryStore;

    #[tokio::test]
    async fn test_starter_caps_at_five() {
        let store = Arc::new(InMemoryStore::new());
        let owner = seeded(&store, PlanTier::Starter);
        let gate = UsageGate::new(store);

        let below = gate.check(owner, 4).await.unwrap();
        assert!(below.within_limit);
        assert_eq!(below.limit, Some(5));

        let at_cap = gate.check(owner, 5).await.unwrap();
        assert!(!at_cap.within_limit);

        let over = gate.check(owner, 9).await.unwrap();
        assert!(!over.within_limit);
    }

    #[tokio::test]
    async fn test_professional_caps_at_twenty_five() {
        let store = Arc::new(InMemoryStore::new());
        let owner = seeded(&store, PlanTier::Professional);
        let gate = UsageGate::new(store);

        assert!(gate.check(owner, 24).await.unwrap().within_limit);
        assert!(!gate.check(owner, 25).await.unwrap().within_limit);
    }

    #[tokio::test]
    async fn test_stored_limit_wins_over_the_tier_table() {
        // A record written when the tier carried a different cap keeps the
        // cap it was granted; the gate never rederives from the tier.
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::new();
        let mut record = EntitlementRecord::new_default(owner);
        record.status = SubscriptionStatus::Active;
        record.plan_tier = PlanTier::Professional;
        record.resource_limit = Some(3);
        store.seed_record(record);

        let gate = UsageGate::new(store);
        let check = gate.check(owner, 10).await.unwrap();
        assert_eq!(check.limit, Some(3));
        assert!(!check.within_limit);

        let below = gate.check(owner, 2).await.unwrap();
        assert!(below.within_limit);
    }

    #[tokio::test]
    async fn test_enterprise_and_missing_records_are_unlimited() {
        let store = Arc::new(InMemoryStore::new());
        let enterprise = seeded(&store, PlanTier::Enterprise);
        let gate = UsageGate::new(store);

        let check = gate.check(enterprise, 1_000_000).await.unwrap();
        assert!(check.within_limit);
        assert_eq!(check.limit, None);

        // No record at all behaves the same way.
        let unknown = gate.check(OwnerId::new(), 1_000_000).await.unwrap();
        assert!(unknown.within_limit);
        assert_eq!(unknown.limit, None);
    }
}
