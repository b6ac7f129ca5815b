#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Impactline Entitlement Core
//!
//! Subscription state machine, access code redemption, webhook
//! reconciliation, and access evaluation for the Impactline platform.

pub mod catalog;
pub mod codes;
pub mod error;
pub mod evaluate;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;
pub mod trial;
pub mod usage;
pub mod webhook;

pub use catalog::TierCatalog;
pub use codes::{AccessCodeRegistry, Redemption};
pub use error::{EntitlementError, EntitlementResult};
pub use evaluate::{
    AccessDecision, AccessEvaluator, AccessReason, InheritanceLookup, PgInheritanceLookup,
    PAST_DUE_GRACE_DAYS,
};
pub use memory::InMemoryStore;
pub use postgres::PgEntitlementStore;
pub use record::EntitlementRecord;
pub use store::{
    AccessCode, EntitlementStore, EventClaim, EventOutcome, RedemptionOutcome, CAS_MAX_ATTEMPTS,
};
pub use trial::{TrialActivator, TRIAL_DAYS};
pub use usage::{UsageCheck, UsageGate};
pub use webhook::{
    verify_signature, BillingEvent, ParsedEvent, ReconcileOutcome, WebhookReconciler,
};

#[cfg(test)]
mod lifecycle_tests {
    //! End-to-end subscription lifecycle against the in-memory store.

    use std::sync::Arc;

    use serde_json::json;
    use time::{Duration, OffsetDateTime};

    use impactline_shared::{OwnerId, PlanTier, SubscriptionStatus};

    use crate::catalog::TierCatalog;
    use crate::evaluate::{evaluate_record, AccessReason};
    use crate::memory::InMemoryStore;
    use crate::store::EntitlementStore;
    use crate::trial::TrialActivator;
    use crate::webhook::{ParsedEvent, ReconcileOutcome, WebhookReconciler};

    fn parsed(
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
        object: serde_json::Value,
    ) -> ParsedEvent {
        let payload = json!({
            "eventId": event_id,
            "type": event_type,
            "occurredAt": occurred_at.unix_timestamp(),
            "object": object,
        });
        ParsedEvent::parse(&payload.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_trial_to_paid_to_past_due_lifecycle() {
        let store = Arc::new(InMemoryStore::new());
        let catalog = TierCatalog::new().with_price("price_pro", PlanTier::Professional);
        let reconciler = WebhookReconciler::new(store.clone(), catalog);
        let owner = OwnerId::new();
        let t0 = OffsetDateTime::now_utc();

        // Owner starts a trial, then converts to a paid plan.
        TrialActivator::new(store.clone())
            .start_trial(owner)
            .await
            .unwrap();

        let checkout = parsed(
            "evt_1",
            "checkout_completed",
            t0 + Duration::minutes(1),
            json!({
                "metadata": { "owner_id": owner.to_string() },
                "customer": "cus_1",
                "subscription": "sub_1",
                "price": "price_pro",
                "current_period_start": t0.unix_timestamp(),
                "current_period_end": (t0 + Duration::days(30)).unix_timestamp(),
            }),
        );
        assert_eq!(
            reconciler.reconcile(&checkout).await.unwrap(),
            ReconcileOutcome::Applied
        );

        let record = store.get(owner).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.plan_tier, PlanTier::Professional);
        assert_eq!(record.resource_limit, Some(25));
        assert!(evaluate_record(&record, t0 + Duration::minutes(2)).has_access);

        // A payment fails; the grace window keeps access for a few days.
        let failed = parsed(
            "evt_2",
            "invoice_payment_failed",
            t0 + Duration::days(30),
            json!({ "subscription": "sub_1" }),
        );
        assert_eq!(
            reconciler.reconcile(&failed).await.unwrap(),
            ReconcileOutcome::Applied
        );

        let record = store.get(owner).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);

        let in_grace = evaluate_record(&record, t0 + Duration::days(31));
        assert!(in_grace.has_access);
        assert_eq!(in_grace.reason, AccessReason::PastDue);

        let past_grace = evaluate_record(&record, t0 + Duration::days(35));
        assert!(!past_grace.has_access);
        assert_eq!(past_grace.reason, AccessReason::PastDue);

        // Retry succeeds and the provider reports the subscription active.
        let recovered = parsed(
            "evt_3",
            "subscription_updated",
            t0 + Duration::days(31),
            json!({
                "subscription": "sub_1",
                "status": "active",
                "price": "price_pro",
            }),
        );
        assert_eq!(
            reconciler.reconcile(&recovered).await.unwrap(),
            ReconcileOutcome::Applied
        );

        let record = store.get(owner).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert!(record.past_due_since.is_none());
        assert!(evaluate_record(&record, t0 + Duration::days(31)).has_access);
    }
}
