//! Webhook reconciliation
//!
//! Maps externally-delivered billing events to entitlement transitions,
//! enforcing idempotency (provider event ids are claimed atomically in the
//! ledger) and event ordering (an event older than the record's `updated_at`
//! is logged but applies no mutation, so a late stale update can never undo a
//! cancellation).

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use impactline_shared::{OwnerId, SubscriptionStatus};

use crate::catalog::TierCatalog;
use crate::error::{EntitlementError, EntitlementResult};
use crate::store::{with_cas_retry, EntitlementStore, EventClaim, EventOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of the signature timestamp.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// =============================================================================
// Signature verification
// =============================================================================

/// Verify the provider's signature header before anything touches state.
///
/// Header format: `t=<unix>,v1=<hex hmac>`. The signed payload is
/// `"{t}.{body}"` keyed with the shared webhook secret. An unverified payload
/// must never influence state, so failure short-circuits with no log entry
/// and no mutation.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
) -> EntitlementResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(EntitlementError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(EntitlementError::SignatureInvalid)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(EntitlementError::SignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| EntitlementError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed.as_bytes().ct_eq(v1_signature.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(EntitlementError::SignatureInvalid)
    }
}

// =============================================================================
// Event model
// =============================================================================

/// Raw wire shape of an inbound webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-reported unix timestamp, the causal-ordering fence.
    #[serde(rename = "occurredAt")]
    pub occurred_at: i64,
    #[serde(default)]
    pub object: serde_json::Value,
}

/// Provider-reported subscription status on `subscription_updated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Active,
    PastDue,
    Other(String),
}

impl ProviderStatus {
    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Closed set of internally-recognized billing events.
///
/// `Unrecognized` is a first-class variant: unknown types are accepted and
/// logged but produce no mutation, which keeps the provider from
/// retry-storming on events this core intentionally ignores.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted {
        owner_id: OwnerId,
        customer_ref: String,
        subscription_ref: String,
        price_ref: Option<String>,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    },
    SubscriptionUpdated {
        subscription_ref: String,
        provider_status: ProviderStatus,
        price_ref: Option<String>,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
        cancel_at_period_end: bool,
    },
    SubscriptionDeleted {
        subscription_ref: String,
    },
    InvoicePaymentFailed {
        subscription_ref: String,
    },
    Unrecognized {
        event_type: String,
    },
}

/// A verified, decoded webhook ready for reconciliation.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub kind: BillingEvent,
}

impl ParsedEvent {
    pub fn parse(payload: &str) -> EntitlementResult<Self> {
        let envelope: WebhookEnvelope = serde_json::from_str(payload)
            .map_err(|e| EntitlementError::Validation(format!("malformed webhook body: {e}")))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: WebhookEnvelope) -> EntitlementResult<Self> {
        let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.occurred_at)
            .map_err(|_| EntitlementError::Validation("invalid occurredAt timestamp".into()))?;

        let object = &envelope.object;
        let kind = match envelope.event_type.as_str() {
            "checkout_completed" => BillingEvent::CheckoutCompleted {
                owner_id: require_owner_id(object)?,
                customer_ref: require_str(object, "customer")?,
                subscription_ref: require_str(object, "subscription")?,
                price_ref: optional_str(object, "price"),
                period_start: optional_timestamp(object, "current_period_start"),
                period_end: optional_timestamp(object, "current_period_end"),
            },
            "subscription_updated" => BillingEvent::SubscriptionUpdated {
                subscription_ref: require_str(object, "subscription")?,
                provider_status: ProviderStatus::parse(&require_str(object, "status")?),
                price_ref: optional_str(object, "price"),
                period_start: optional_timestamp(object, "current_period_start"),
                period_end: optional_timestamp(object, "current_period_end"),
                cancel_at_period_end: object
                    .get("cancel_at_period_end")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            "subscription_deleted" => BillingEvent::SubscriptionDeleted {
                subscription_ref: require_str(object, "subscription")?,
            },
            "invoice_payment_failed" => BillingEvent::InvoicePaymentFailed {
                subscription_ref: require_str(object, "subscription")?,
            },
            other => BillingEvent::Unrecognized {
                event_type: other.to_string(),
            },
        };

        Ok(Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            occurred_at,
            kind,
        })
    }
}

fn require_str(object: &serde_json::Value, field: &str) -> EntitlementResult<String> {
    object
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| EntitlementError::Validation(format!("webhook object missing '{field}'")))
}

fn optional_str(object: &serde_json::Value, field: &str) -> Option<String> {
    object.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

fn optional_timestamp(object: &serde_json::Value, field: &str) -> Option<OffsetDateTime> {
    object
        .get(field)
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// Checkout sessions are created out-of-band with the owner id in metadata.
fn require_owner_id(object: &serde_json::Value) -> EntitlementResult<OwnerId> {
    let raw = object
        .get("metadata")
        .and_then(|m| m.get("owner_id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EntitlementError::Validation("checkout object missing metadata.owner_id".into())
        })?;
    let uuid = raw
        .parse::<uuid::Uuid>()
        .map_err(|_| EntitlementError::Validation("metadata.owner_id is not a UUID".into()))?;
    Ok(OwnerId(uuid))
}

// =============================================================================
// Reconciler
// =============================================================================

/// How a reconciled event was disposed of. Everything here maps to HTTP 200;
/// only transient storage failures surface as errors (500, provider retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Logged for idempotency but mutated nothing: stale timestamp, unknown
    /// subscription ref, or an ineligible from-state.
    NoOp,
    /// The event id was already in the ledger.
    Duplicate,
    Unrecognized,
}

pub struct WebhookReconciler<S> {
    store: Arc<S>,
    catalog: TierCatalog,
}

impl<S: EntitlementStore> WebhookReconciler<S> {
    pub fn new(store: Arc<S>, catalog: TierCatalog) -> Self {
        Self { store, catalog }
    }

    /// Reconcile one verified event.
    ///
    /// Claim, apply, then mark. A crash between apply and mark leaves the
    /// row re-claimable, and re-application is harmless because the
    /// stale-timestamp fence makes it a no-op.
    pub async fn reconcile(&self, event: &ParsedEvent) -> EntitlementResult<ReconcileOutcome> {
        match self
            .store
            .claim_event(&event.event_id, &event.event_type, event.occurred_at)
            .await?
        {
            EventClaim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, returning success without reapplying"
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
            EventClaim::Claimed => {}
        }

        let result = self.apply(event).await;

        let outcome = match &result {
            Ok(ReconcileOutcome::Applied) => EventOutcome::Success,
            Ok(_) => EventOutcome::Ignored,
            Err(_) => EventOutcome::Error,
        };
        if let Err(mark_err) = self.store.finish_event(&event.event_id, outcome).await {
            tracing::error!(
                event_id = %event.event_id,
                error = %mark_err,
                "Failed to record webhook processing outcome"
            );
        }

        result
    }

    async fn apply(&self, event: &ParsedEvent) -> EntitlementResult<ReconcileOutcome> {
        match &event.kind {
            BillingEvent::CheckoutCompleted {
                owner_id,
                customer_ref,
                subscription_ref,
                price_ref,
                period_start,
                period_end,
            } => {
                self.apply_checkout_completed(
                    event,
                    *owner_id,
                    customer_ref,
                    subscription_ref,
                    price_ref.as_deref(),
                    *period_start,
                    *period_end,
                )
                .await
            }
            BillingEvent::SubscriptionUpdated {
                subscription_ref,
                provider_status,
                price_ref,
                period_start,
                period_end,
                cancel_at_period_end,
            } => {
                self.apply_subscription_updated(
                    event,
                    subscription_ref,
                    provider_status,
                    price_ref.as_deref(),
                    *period_start,
                    *period_end,
                    *cancel_at_period_end,
                )
                .await
            }
            BillingEvent::SubscriptionDeleted { subscription_ref } => {
                self.apply_subscription_deleted(event, subscription_ref).await
            }
            BillingEvent::InvoicePaymentFailed { subscription_ref } => {
                self.apply_invoice_payment_failed(event, subscription_ref).await
            }
            BillingEvent::Unrecognized { event_type } => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event_type,
                    "Unrecognized billing event type, accepted as no-op"
                );
                Ok(ReconcileOutcome::Unrecognized)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_checkout_completed(
        &self,
        event: &ParsedEvent,
        owner_id: OwnerId,
        customer_ref: &str,
        subscription_ref: &str,
        price_ref: Option<&str>,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> EntitlementResult<ReconcileOutcome> {
        with_cas_retry("checkout_completed", || async {
            let record = self.store.get_or_create(owner_id).await?;
            // No timestamp fence here: `updated_at` on a none/trial record
            // comes from our clock (creation or trial start), not the
            // provider's, and clock skew must not drop a paying user's
            // checkout. A stale checkout replay after cancellation is caught
            // by the from-state guard below.
            if !matches!(
                record.status,
                SubscriptionStatus::None | SubscriptionStatus::Trial
            ) {
                tracing::warn!(
                    owner_id = %owner_id,
                    status = %record.status,
                    event_id = %event.event_id,
                    "checkout_completed for owner not in none/trial, ignoring"
                );
                return Ok(ReconcileOutcome::NoOp);
            }

            let tier = self.catalog.tier_for_price(price_ref);
            let mut next = record.clone();
            next.status = SubscriptionStatus::Active;
            next.plan_tier = tier;
            next.resource_limit = tier.resource_limit();
            next.billing_customer_ref = Some(customer_ref.to_string());
            next.billing_subscription_ref = Some(subscription_ref.to_string());
            next.billing_price_ref = price_ref.map(str::to_string);
            next.current_period_start = period_start;
            next.current_period_end = period_end;
            next.cancel_at_period_end = false;
            next.past_due_since = None;
            next.updated_at = event.occurred_at;
            self.store.compare_and_swap(record.version, &next).await?;

            tracing::info!(
                owner_id = %owner_id,
                subscription_ref = %subscription_ref,
                tier = %tier,
                "Checkout completed, subscription active"
            );
            Ok(ReconcileOutcome::Applied)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_subscription_updated(
        &self,
        event: &ParsedEvent,
        subscription_ref: &str,
        provider_status: &ProviderStatus,
        price_ref: Option<&str>,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
        cancel_at_period_end: bool,
    ) -> EntitlementResult<ReconcileOutcome> {
        with_cas_retry("subscription_updated", || async {
            let Some(record) = self.store.find_by_subscription_ref(subscription_ref).await? else {
                tracing::warn!(
                    subscription_ref = %subscription_ref,
                    event_id = %event.event_id,
                    "subscription_updated for unknown subscription ref, ignoring"
                );
                return Ok(ReconcileOutcome::NoOp);
            };
            if event.occurred_at < record.updated_at {
                tracing::info!(
                    event_id = %event.event_id,
                    occurred_at = %event.occurred_at,
                    record_updated_at = %record.updated_at,
                    "Stale subscription_updated, logged without applying"
                );
                return Ok(ReconcileOutcome::NoOp);
            }

            let mut next = record.clone();
            match provider_status {
                ProviderStatus::Active
                    if matches!(
                        record.status,
                        SubscriptionStatus::Active | SubscriptionStatus::PastDue
                    ) =>
                {
                    next.status = SubscriptionStatus::Active;
                    next.past_due_since = None;
                }
                ProviderStatus::PastDue if record.status == SubscriptionStatus::Active => {
                    next.status = SubscriptionStatus::PastDue;
                    next.past_due_since = Some(event.occurred_at);
                }
                other => {
                    tracing::info!(
                        subscription_ref = %subscription_ref,
                        record_status = %record.status,
                        provider_status = ?other,
                        "subscription_updated with no applicable transition, ignoring"
                    );
                    return Ok(ReconcileOutcome::NoOp);
                }
            }

            if let Some(price) = price_ref {
                let tier = self.catalog.tier_for_price(Some(price));
                next.plan_tier = tier;
                next.resource_limit = tier.resource_limit();
                next.billing_price_ref = Some(price.to_string());
            }
            next.current_period_start = period_start.or(record.current_period_start);
            next.current_period_end = period_end.or(record.current_period_end);
            next.cancel_at_period_end = cancel_at_period_end;
            next.updated_at = event.occurred_at;
            self.store.compare_and_swap(record.version, &next).await?;
            Ok(ReconcileOutcome::Applied)
        })
        .await
    }

    async fn apply_subscription_deleted(
        &self,
        event: &ParsedEvent,
        subscription_ref: &str,
    ) -> EntitlementResult<ReconcileOutcome> {
        with_cas_retry("subscription_deleted", || async {
            let Some(record) = self.store.find_by_subscription_ref(subscription_ref).await? else {
                tracing::warn!(
                    subscription_ref = %subscription_ref,
                    event_id = %event.event_id,
                    "subscription_deleted for unknown subscription ref, ignoring"
                );
                return Ok(ReconcileOutcome::NoOp);
            };
            if event.occurred_at < record.updated_at {
                return Ok(ReconcileOutcome::NoOp);
            }
            if record.status.is_terminal() {
                return Ok(ReconcileOutcome::NoOp);
            }

            let mut next = record.clone();
            next.status = SubscriptionStatus::Cancelled;
            next.cancelled_at = Some(event.occurred_at);
            next.cancel_at_period_end = false;
            next.past_due_since = None;
            next.updated_at = event.occurred_at;
            self.store.compare_and_swap(record.version, &next).await?;

            tracing::info!(
                owner_id = %record.owner_id,
                subscription_ref = %subscription_ref,
                "Subscription cancelled"
            );
            Ok(ReconcileOutcome::Applied)
        })
        .await
    }

    /// Redundant path to `past_due`: some providers fire this before the
    /// status update, some after, so both must land on the same state.
    async fn apply_invoice_payment_failed(
        &self,
        event: &ParsedEvent,
        subscription_ref: &str,
    ) -> EntitlementResult<ReconcileOutcome> {
        with_cas_retry("invoice_payment_failed", || async {
            let Some(record) = self.store.find_by_subscription_ref(subscription_ref).await? else {
                tracing::warn!(
                    subscription_ref = %subscription_ref,
                    event_id = %event.event_id,
                    "invoice_payment_failed for unknown subscription ref, ignoring"
                );
                return Ok(ReconcileOutcome::NoOp);
            };
            if event.occurred_at < record.updated_at {
                return Ok(ReconcileOutcome::NoOp);
            }
            if record.status != SubscriptionStatus::Active {
                return Ok(ReconcileOutcome::NoOp);
            }

            let mut next = record.clone();
            next.status = SubscriptionStatus::PastDue;
            next.past_due_since = Some(event.occurred_at);
            next.updated_at = event.occurred_at;
            self.store.compare_and_swap(record.version, &next).await?;

            tracing::warn!(
                owner_id = %record.owner_id,
                subscription_ref = %subscription_ref,
                "Invoice payment failed, subscription past due"
            );
            Ok(ReconcileOutcome::Applied)
        })
        .await
    }
}
