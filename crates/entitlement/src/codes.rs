//! Access code redemption
//!
//! Validates and redeems one-time codes that grant bonus trial days.
//! Redemption is cumulative: a code redeemed while a trial is running extends
//! `trial_ends_at` additively instead of resetting it.

use std::sync::Arc;

use impactline_shared::{OwnerId, SubscriptionStatus};
use time::{Duration, OffsetDateTime};

use crate::error::{EntitlementError, EntitlementResult};
use crate::record::EntitlementRecord;
use crate::store::{with_cas_retry, EntitlementStore, RedemptionOutcome};

/// Result of a successful redemption.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub record: EntitlementRecord,
    pub days_granted: i32,
}

pub struct AccessCodeRegistry<S> {
    store: Arc<S>,
}

impl<S: EntitlementStore> AccessCodeRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Redeem a code for an owner.
    ///
    /// Validation order: format, code exists, not expired, redemption count
    /// below max, owner has not already redeemed. The count only increments
    /// on successful application; the cap is enforced by the store's atomic
    /// guarded increment, not by the read-side pre-checks.
    pub async fn redeem(&self, owner_id: OwnerId, raw_code: &str) -> EntitlementResult<Redemption> {
        let code = normalize_code(raw_code)?;

        let access_code = self
            .store
            .get_code(&code)
            .await?
            .ok_or(EntitlementError::CodeInvalid)?;

        let now = OffsetDateTime::now_utc();
        if let Some(expires_at) = access_code.expires_at {
            if now > expires_at {
                return Err(EntitlementError::CodeExpired);
            }
        }
        if access_code.redemption_count >= access_code.max_redemptions {
            return Err(EntitlementError::CodeCapExceeded);
        }
        if self.store.has_redeemed(&code, owner_id).await? {
            return Err(EntitlementError::AlreadyRedeemed);
        }

        // Eligibility before consuming the redemption, so an ineligible owner
        // never burns a redemption slot.
        let record = self.store.get_or_create(owner_id).await?;
        match record.status {
            SubscriptionStatus::None | SubscriptionStatus::Trial => {}
            status => return Err(EntitlementError::NotEligible { status }),
        }

        match self.store.consume_redemption(&code, owner_id).await? {
            RedemptionOutcome::Consumed => {}
            RedemptionOutcome::CapExceeded => return Err(EntitlementError::CodeCapExceeded),
            RedemptionOutcome::AlreadyRedeemed => return Err(EntitlementError::AlreadyRedeemed),
        }

        let days = access_code.days_granted;
        let record = with_cas_retry("redeem_code", || async {
            let record = self.store.get_or_create(owner_id).await?;
            let now = OffsetDateTime::now_utc();
            let mut next = record.clone();
            match record.status {
                SubscriptionStatus::None => {
                    next.status = SubscriptionStatus::Trial;
                    next.trial_started_at = Some(now);
                    next.trial_ends_at = Some(now + Duration::days(days as i64));
                }
                SubscriptionStatus::Trial => {
                    let current_end = record.trial_ends_at.unwrap_or(now);
                    next.trial_ends_at = Some(current_end + Duration::days(days as i64));
                }
                status => return Err(EntitlementError::NotEligible { status }),
            }
            next.updated_at = now;
            self.store.compare_and_swap(record.version, &next).await
        })
        .await?;

        tracing::info!(
            owner_id = %owner_id,
            code = %code,
            days_granted = days,
            trial_ends_at = ?record.trial_ends_at,
            "Access code redeemed"
        );

        Ok(Redemption {
            record,
            days_granted: days,
        })
    }
}

/// Codes are case-insensitive; stored and compared uppercased.
fn normalize_code(raw: &str) -> EntitlementResult<String> {
    let code = raw.trim().to_uppercase();
    if code.is_empty() || code.len() > 64 {
        return Err(EntitlementError::Validation(
            "access code must be between 1 and 64 characters".to_string(),
        ));
    }
    Ok(code)
}
