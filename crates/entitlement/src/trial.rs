//! Trial activation
//!
//! Transitions an owner from `none` to `trial`, idempotently. The
//! precondition check plus compare-and-swap guarantees at most one transition
//! wins under concurrent duplicate requests; the loser observes
//! `AlreadyUsedOrActive` with status `trial`, which callers treat as
//! success-equivalent.

use std::sync::Arc;

use impactline_shared::{OwnerId, SubscriptionStatus};
use time::{Duration, OffsetDateTime};

use crate::error::{EntitlementError, EntitlementResult};
use crate::record::EntitlementRecord;
use crate::store::{with_cas_retry, EntitlementStore};

/// Length of the standard free trial.
pub const TRIAL_DAYS: i64 = 30;

pub struct TrialActivator<S> {
    store: Arc<S>,
}

impl<S: EntitlementStore> TrialActivator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Start the one-shot trial for an owner.
    ///
    /// Trials never restart: once `status` has left `none` it never returns,
    /// so any other status fails with the current status attached.
    pub async fn start_trial(&self, owner_id: OwnerId) -> EntitlementResult<EntitlementRecord> {
        let record = with_cas_retry("start_trial", || async {
            let record = self.store.get_or_create(owner_id).await?;
            if record.status != SubscriptionStatus::None {
                return Err(EntitlementError::AlreadyUsedOrActive {
                    status: record.status,
                });
            }

            let now = OffsetDateTime::now_utc();
            let mut next = record.clone();
            next.status = SubscriptionStatus::Trial;
            next.trial_started_at = Some(now);
            next.trial_ends_at = Some(now + Duration::days(TRIAL_DAYS));
            next.updated_at = now;
            self.store.compare_and_swap(record.version, &next).await
        })
        .await?;

        tracing::info!(
            owner_id = %owner_id,
            trial_ends_at = ?record.trial_ends_at,
            "Trial started"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    #[tokio::test]
    async fn test_start_trial_sets_thirty_day_window() {
        let store = Arc::new(InMemoryStore::new());
        let activator = TrialActivator::new(store.clone());
        let owner = OwnerId::new();

        let record = activator.start_trial(owner).await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::Trial);
        assert_eq!(record.version, 2);

        let started = record.trial_started_at.unwrap();
        let ends = record.trial_ends_at.unwrap();
        assert_eq!(ends - started, Duration::days(TRIAL_DAYS));
    }

    #[tokio::test]
    async fn test_second_start_reports_current_status() {
        let store = Arc::new(InMemoryStore::new());
        let activator = TrialActivator::new(store.clone());
        let owner = OwnerId::new();

        activator.start_trial(owner).await.unwrap();
        let err = activator.start_trial(owner).await.unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::AlreadyUsedOrActive {
                status: SubscriptionStatus::Trial
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_requests_have_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::new();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { TrialActivator::new(store).start_trial(owner).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { TrialActivator::new(store).start_trial(owner).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let losses = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(EntitlementError::AlreadyUsedOrActive {
                        status: SubscriptionStatus::Trial
                    })
                )
            })
            .count();
        assert_eq!(wins, 1);
        assert_eq!(losses, 1);

        // Exactly one transition was recorded.
        let stored = store.get(owner).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.trial_started_at.is_some());
    }
}
