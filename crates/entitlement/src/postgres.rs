//! PostgreSQL-backed entitlement store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use impactline_shared::OwnerId;

use crate::error::{EntitlementError, EntitlementResult};
use crate::record::EntitlementRecord;
use crate::store::{
    AccessCode, EntitlementStore, EventClaim, EventOutcome, RedemptionOutcome,
};

/// Events stuck in `processing` longer than this are assumed crashed and can
/// be re-claimed by a later delivery.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

const RECORD_COLUMNS: &str = r#"
    id, owner_id, status, plan_tier,
    trial_started_at, trial_ends_at,
    billing_customer_ref, billing_subscription_ref, billing_price_ref,
    current_period_start, current_period_end,
    cancel_at_period_end, cancelled_at, past_due_since,
    resource_limit, version, updated_at
"#;

/// Production entitlement store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn get(&self, owner_id: OwnerId) -> EntitlementResult<Option<EntitlementRecord>> {
        let record = sqlx::query_as::<_, EntitlementRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM entitlements WHERE owner_id = $1"
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> EntitlementResult<Option<EntitlementRecord>> {
        let record = sqlx::query_as::<_, EntitlementRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM entitlements WHERE billing_subscription_ref = $1"
        ))
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn create_default(&self, owner_id: OwnerId) -> EntitlementResult<EntitlementRecord> {
        let default = EntitlementRecord::new_default(owner_id);

        // ON CONFLICT DO NOTHING: a concurrent creator wins the unique
        // constraint and we read their row back.
        sqlx::query(
            r#"
            INSERT INTO entitlements
                (id, owner_id, status, plan_tier, cancel_at_period_end, version, updated_at)
            VALUES ($1, $2, $3, $4, FALSE, 1, $5)
            ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(default.id)
        .bind(default.owner_id)
        .bind(default.status)
        .bind(default.plan_tier)
        .bind(default.updated_at)
        .execute(&self.pool)
        .await?;

        self.get(owner_id).await?.ok_or_else(|| {
            EntitlementError::Database(format!("entitlement record for {owner_id} vanished"))
        })
    }

    async fn compare_and_swap(
        &self,
        expected_version: i64,
        record: &EntitlementRecord,
    ) -> EntitlementResult<EntitlementRecord> {
        let updated = sqlx::query_as::<_, EntitlementRecord>(&format!(
            r#"
            UPDATE entitlements SET
                status = $1,
                plan_tier = $2,
                trial_started_at = $3,
                trial_ends_at = $4,
                billing_customer_ref = $5,
                billing_subscription_ref = $6,
                billing_price_ref = $7,
                current_period_start = $8,
                current_period_end = $9,
                cancel_at_period_end = $10,
                cancelled_at = $11,
                past_due_since = $12,
                resource_limit = $13,
                version = $14 + 1,
                updated_at = $15
            WHERE owner_id = $16 AND version = $14
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(record.status)
        .bind(record.plan_tier)
        .bind(record.trial_started_at)
        .bind(record.trial_ends_at)
        .bind(&record.billing_customer_ref)
        .bind(&record.billing_subscription_ref)
        .bind(&record.billing_price_ref)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.cancelled_at)
        .bind(record.past_due_since)
        .bind(record.resource_limit)
        .bind(expected_version)
        .bind(record.updated_at)
        .bind(record.owner_id)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            EntitlementError::VersionConflict(format!(
                "owner {} expected version {}",
                record.owner_id, expected_version
            ))
        })
    }

    async fn get_code(&self, code: &str) -> EntitlementResult<Option<AccessCode>> {
        let code = sqlx::query_as::<_, AccessCode>(
            r#"
            SELECT code, days_granted, max_redemptions, redemption_count, expires_at, created_at
            FROM access_codes
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(code)
    }

    async fn has_redeemed(&self, code: &str, owner_id: OwnerId) -> EntitlementResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM access_code_redemptions WHERE code = $1 AND owner_id = $2",
        )
        .bind(code)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn consume_redemption(
        &self,
        code: &str,
        owner_id: OwnerId,
    ) -> EntitlementResult<RedemptionOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO access_code_redemptions (code, owner_id, redeemed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (code, owner_id) DO NOTHING
            "#,
        )
        .bind(code)
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RedemptionOutcome::AlreadyRedeemed);
        }

        // Guarded increment: the cap check and the increment are one
        // statement, so two concurrent redemptions cannot both pass the cap.
        let incremented = sqlx::query(
            r#"
            UPDATE access_codes
            SET redemption_count = redemption_count + 1
            WHERE code = $1 AND redemption_count < max_redemptions
            "#,
        )
        .bind(code)
        .execute(&mut *tx)
        .await?;

        if incremented.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RedemptionOutcome::CapExceeded);
        }

        tx.commit().await?;
        Ok(RedemptionOutcome::Consumed)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
    ) -> EntitlementResult<EventClaim> {
        // INSERT...ON CONFLICT...RETURNING: only one concurrent delivery can
        // claim processing rights. Rows finished with 'error' or stuck in
        // 'processing' past the timeout are re-claimable so redelivery
        // eventually converges.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, occurred_at, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(occurred_at)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match claimed {
            Some(_) => EventClaim::Claimed,
            None => EventClaim::AlreadyProcessed,
        })
    }

    async fn finish_event(&self, event_id: &str, outcome: EventOutcome) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, processed_at = NOW()
            WHERE event_id = $2
            "#,
        )
        .bind(outcome.as_str())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_event_log(&self, retention_days: i64) -> EntitlementResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE occurred_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(retention_days as i32)
        .execute(&self.pool)
        .await?;

        Ok(deleted.rows_affected())
    }
}
