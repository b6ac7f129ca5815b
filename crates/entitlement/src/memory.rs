//! In-memory entitlement store
//!
//! Test substitute for the PostgreSQL store. Implements the same
//! compare-and-swap and uniqueness semantics so concurrency properties can be
//! exercised without a database.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use impactline_shared::OwnerId;

use crate::error::{EntitlementError, EntitlementResult};
use crate::record::EntitlementRecord;
use crate::store::{
    AccessCode, EntitlementStore, EventClaim, EventOutcome, RedemptionOutcome,
};

/// Claims stuck in `processing` longer than this are assumed crashed and
/// re-claimable, matching the PostgreSQL store.
const PROCESSING_TIMEOUT: time::Duration = time::Duration::minutes(30);

#[derive(Debug, Clone)]
struct EventRow {
    event_type: String,
    occurred_at: OffsetDateTime,
    result: &'static str,
    processing_started_at: OffsetDateTime,
}

#[derive(Default)]
struct Inner {
    records: HashMap<OwnerId, EntitlementRecord>,
    codes: HashMap<String, AccessCode>,
    redemptions: HashSet<(String, OwnerId)>,
    events: HashMap<String, EventRow>,
}

/// In-memory store with the same observable semantics as the PostgreSQL
/// implementation.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a record directly, bypassing compare-and-swap. Test setup only.
    pub fn seed_record(&self, record: EntitlementRecord) {
        self.lock().records.insert(record.owner_id, record);
    }

    /// Seed an access code. Codes are created out-of-band in production.
    pub fn seed_code(&self, code: AccessCode) {
        self.lock().codes.insert(code.code.clone(), code);
    }

    /// Number of ledger entries, for idempotency assertions.
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    /// Backdate an event's claim time, simulating a processor that crashed
    /// mid-claim. Test setup only.
    pub fn backdate_event_claim(&self, event_id: &str, by: time::Duration) {
        if let Some(row) = self.lock().events.get_mut(event_id) {
            row.processing_started_at -= by;
        }
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn get(&self, owner_id: OwnerId) -> EntitlementResult<Option<EntitlementRecord>> {
        Ok(self.lock().records.get(&owner_id).cloned())
    }

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> EntitlementResult<Option<EntitlementRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .find(|r| r.billing_subscription_ref.as_deref() == Some(subscription_ref))
            .cloned())
    }

    async fn create_default(&self, owner_id: OwnerId) -> EntitlementResult<EntitlementRecord> {
        let mut inner = self.lock();
        let record = inner
            .records
            .entry(owner_id)
            .or_insert_with(|| EntitlementRecord::new_default(owner_id));
        Ok(record.clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: i64,
        record: &EntitlementRecord,
    ) -> EntitlementResult<EntitlementRecord> {
        let mut inner = self.lock();
        match inner.records.get_mut(&record.owner_id) {
            Some(current) if current.version == expected_version => {
                let mut next = record.clone();
                next.version = expected_version + 1;
                *current = next.clone();
                Ok(next)
            }
            Some(current) => Err(EntitlementError::VersionConflict(format!(
                "owner {} expected version {}, found {}",
                record.owner_id, expected_version, current.version
            ))),
            None => Err(EntitlementError::VersionConflict(format!(
                "owner {} has no record",
                record.owner_id
            ))),
        }
    }

    async fn get_code(&self, code: &str) -> EntitlementResult<Option<AccessCode>> {
        Ok(self.lock().codes.get(code).cloned())
    }

    async fn has_redeemed(&self, code: &str, owner_id: OwnerId) -> EntitlementResult<bool> {
        Ok(self
            .lock()
            .redemptions
            .contains(&(code.to_string(), owner_id)))
    }

    async fn consume_redemption(
        &self,
        code: &str,
        owner_id: OwnerId,
    ) -> EntitlementResult<RedemptionOutcome> {
        let mut inner = self.lock();
        let key = (code.to_string(), owner_id);
        if inner.redemptions.contains(&key) {
            return Ok(RedemptionOutcome::AlreadyRedeemed);
        }
        let Some(access_code) = inner.codes.get_mut(code) else {
            return Err(EntitlementError::Database(format!(
                "access code {code} vanished"
            )));
        };
        if access_code.redemption_count >= access_code.max_redemptions {
            return Ok(RedemptionOutcome::CapExceeded);
        }
        access_code.redemption_count += 1;
        inner.redemptions.insert(key);
        Ok(RedemptionOutcome::Consumed)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
    ) -> EntitlementResult<EventClaim> {
        let mut inner = self.lock();
        let now = OffsetDateTime::now_utc();
        match inner.events.get_mut(event_id) {
            Some(row)
                if row.result == "error"
                    || (row.result == "processing"
                        && row.processing_started_at < now - PROCESSING_TIMEOUT) =>
            {
                row.result = "processing";
                row.processing_started_at = now;
                Ok(EventClaim::Claimed)
            }
            Some(_) => Ok(EventClaim::AlreadyProcessed),
            None => {
                inner.events.insert(
                    event_id.to_string(),
                    EventRow {
                        event_type: event_type.to_string(),
                        occurred_at,
                        result: "processing",
                        processing_started_at: now,
                    },
                );
                Ok(EventClaim::Claimed)
            }
        }
    }

    async fn finish_event(&self, event_id: &str, outcome: EventOutcome) -> EntitlementResult<()> {
        if let Some(row) = self.lock().events.get_mut(event_id) {
            row.result = match outcome {
                EventOutcome::Success => "success",
                EventOutcome::Error => "error",
                EventOutcome::Ignored => "ignored",
            };
        }
        Ok(())
    }

    async fn prune_event_log(&self, retention_days: i64) -> EntitlementResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(retention_days);
        let mut inner = self.lock();
        let before = inner.events.len();
        inner.events.retain(|_, row| row.occurred_at >= cutoff);
        Ok((before - inner.events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactline_shared::SubscriptionStatus;

    #[tokio::test]
    async fn test_create_default_is_idempotent() {
        let store = InMemoryStore::new();
        let owner = OwnerId::new();
        let first = store.create_default(owner).await.unwrap();
        let second = store.create_default(owner).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = InMemoryStore::new();
        let owner = OwnerId::new();
        let record = store.create_default(owner).await.unwrap();

        let mut update = record.clone();
        update.status = SubscriptionStatus::Trial;
        let stored = store.compare_and_swap(record.version, &update).await.unwrap();
        assert_eq!(stored.version, 2);

        // Same expected version again loses.
        let err = store.compare_and_swap(record.version, &update).await;
        assert!(matches!(err, Err(EntitlementError::VersionConflict(_))));
    }

    #[tokio::test]
    async fn test_consume_redemption_enforces_cap_and_uniqueness() {
        let store = InMemoryStore::new();
        store.seed_code(AccessCode {
            code: "WELCOME".into(),
            days_granted: 10,
            max_redemptions: 1,
            redemption_count: 0,
            expires_at: None,
            created_at: OffsetDateTime::now_utc(),
        });

        let a = OwnerId::new();
        let b = OwnerId::new();
        assert_eq!(
            store.consume_redemption("WELCOME", a).await.unwrap(),
            RedemptionOutcome::Consumed
        );
        assert_eq!(
            store.consume_redemption("WELCOME", a).await.unwrap(),
            RedemptionOutcome::AlreadyRedeemed
        );
        assert_eq!(
            store.consume_redemption("WELCOME", b).await.unwrap(),
            RedemptionOutcome::CapExceeded
        );
    }

    #[tokio::test]
    async fn test_claim_event_rejects_duplicates_and_reclaims_errors() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();

        assert_eq!(
            store.claim_event("evt_1", "subscription_updated", now).await.unwrap(),
            EventClaim::Claimed
        );
        assert_eq!(
            store.claim_event("evt_1", "subscription_updated", now).await.unwrap(),
            EventClaim::AlreadyProcessed
        );

        store.finish_event("evt_1", EventOutcome::Error).await.unwrap();
        assert_eq!(
            store.claim_event("evt_1", "subscription_updated", now).await.unwrap(),
            EventClaim::Claimed
        );

        store.finish_event("evt_1", EventOutcome::Success).await.unwrap();
        assert_eq!(
            store.claim_event("evt_1", "subscription_updated", now).await.unwrap(),
            EventClaim::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_claim_event_reclaims_stuck_processing_after_timeout() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();

        store.claim_event("evt_1", "checkout_completed", now).await.unwrap();
        // A fresh claim is still considered live.
        assert_eq!(
            store.claim_event("evt_1", "checkout_completed", now).await.unwrap(),
            EventClaim::AlreadyProcessed
        );

        // Processor crashed without marking the row; past the timeout the
        // next delivery takes over.
        store.backdate_event_claim("evt_1", PROCESSING_TIMEOUT + time::Duration::minutes(1));
        assert_eq!(
            store.claim_event("evt_1", "checkout_completed", now).await.unwrap(),
            EventClaim::Claimed
        );
    }

    #[tokio::test]
    async fn test_prune_event_log_drops_old_entries() {
        let store = InMemoryStore::new();
        let old = OffsetDateTime::now_utc() - time::Duration::days(45);
        let fresh = OffsetDateTime::now_utc();
        store.claim_event("evt_old", "x", old).await.unwrap();
        store.claim_event("evt_new", "x", fresh).await.unwrap();

        let pruned = store.prune_event_log(30).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.event_count(), 1);
    }
}
