//! Entitlement store contract
//!
//! All mutating operations in the core go through `compare_and_swap`; callers
//! retry on `VersionConflict` with bounded exponential backoff. This is the
//! sole concurrency-safety mechanism, since two webhooks or a webhook racing a
//! user-initiated trial start can target the same record simultaneously.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use impactline_shared::OwnerId;

use crate::error::{EntitlementError, EntitlementResult};
use crate::record::EntitlementRecord;

/// Maximum compare-and-swap attempts before surfacing `Transient`.
pub const CAS_MAX_ATTEMPTS: usize = 5;

/// One-time code granting bonus trial days.
///
/// Created out-of-band by an admin; this crate only consumes them.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessCode {
    /// Stored uppercased; lookups are case-insensitive.
    pub code: String,
    pub days_granted: i32,
    pub max_redemptions: i32,
    pub redemption_count: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Result of atomically consuming one redemption of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionOutcome {
    Consumed,
    /// The guarded increment found `redemption_count` already at the cap.
    CapExceeded,
    /// The `(code, owner)` uniqueness constraint rejected a second redemption.
    AlreadyRedeemed,
}

/// Result of attempting to claim a webhook event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller holds exclusive processing rights for the event.
    Claimed,
    /// Another delivery already processed (or is processing) this event id.
    AlreadyProcessed,
}

/// Terminal disposition recorded against a claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Success,
    Error,
    /// Logged for idempotency bookkeeping but produced no mutation
    /// (unrecognized type, stale timestamp, unknown subscription ref).
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Ignored => "ignored",
        }
    }
}

/// Durable storage for entitlement records, access codes, and the webhook
/// idempotency ledger.
///
/// The PostgreSQL implementation backs production; the in-memory
/// implementation substitutes for it in tests.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn get(&self, owner_id: OwnerId) -> EntitlementResult<Option<EntitlementRecord>>;

    /// Lookup by the provider's subscription ref. Subscription lifecycle
    /// events identify the record this way, not by owner.
    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> EntitlementResult<Option<EntitlementRecord>>;

    /// Create a `none` record for the owner. Concurrent duplicate creation
    /// resolves to the existing row via the unique owner constraint.
    async fn create_default(&self, owner_id: OwnerId) -> EntitlementResult<EntitlementRecord>;

    /// Single guarded write: `UPDATE ... WHERE owner_id = .. AND version =
    /// expected`. Returns the stored record with `version = expected + 1`, or
    /// `VersionConflict` if another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: i64,
        record: &EntitlementRecord,
    ) -> EntitlementResult<EntitlementRecord>;

    async fn get_code(&self, code: &str) -> EntitlementResult<Option<AccessCode>>;

    async fn has_redeemed(&self, code: &str, owner_id: OwnerId) -> EntitlementResult<bool>;

    /// Atomically record a redemption and increment `redemption_count`,
    /// guarded by `redemption_count < max_redemptions` and the `(code, owner)`
    /// uniqueness constraint. Closes the check-then-act race between two
    /// concurrent redemptions of a nearly-exhausted code.
    async fn consume_redemption(
        &self,
        code: &str,
        owner_id: OwnerId,
    ) -> EntitlementResult<RedemptionOutcome>;

    /// Atomically claim exclusive processing rights for a provider event id.
    /// A duplicate delivery observes `AlreadyProcessed`. Events stuck in
    /// `processing` past a timeout, or finished with `error`, are re-claimable
    /// so redelivery can converge.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
    ) -> EntitlementResult<EventClaim>;

    async fn finish_event(&self, event_id: &str, outcome: EventOutcome) -> EntitlementResult<()>;

    /// Drop ledger entries older than the retention window. Providers do not
    /// redeliver indefinitely, so old entries are dead weight.
    async fn prune_event_log(&self, retention_days: i64) -> EntitlementResult<u64>;

    /// Fetch the owner's record, creating the default `none` record if the
    /// owner has never touched billing before.
    async fn get_or_create(&self, owner_id: OwnerId) -> EntitlementResult<EntitlementRecord> {
        match self.get(owner_id).await? {
            Some(record) => Ok(record),
            None => self.create_default(owner_id).await,
        }
    }
}

/// Run a load-check-write cycle, retrying on `VersionConflict` with bounded
/// exponential backoff. Exhaustion surfaces as `Transient` so HTTP callers
/// return 500 and the provider's retry policy redelivers later.
pub async fn with_cas_retry<T, F, Fut>(op: &str, attempt: F) -> EntitlementResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EntitlementResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(10)
        .map(jitter)
        .take(CAS_MAX_ATTEMPTS - 1);

    match RetryIf::spawn(strategy, attempt, EntitlementError::is_retryable).await {
        Ok(value) => Ok(value),
        Err(EntitlementError::VersionConflict(detail)) => {
            tracing::warn!(
                operation = op,
                detail = %detail,
                attempts = CAS_MAX_ATTEMPTS,
                "Version conflict retries exhausted"
            );
            Err(EntitlementError::Transient(format!(
                "{op}: version conflict retries exhausted"
            )))
        }
        Err(other) => Err(other),
    }
}
