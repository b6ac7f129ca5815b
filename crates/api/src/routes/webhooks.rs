//! Billing provider webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;

use impactline_entitlement::{verify_signature, ParsedEvent, ReconcileOutcome, WebhookReconciler};

use crate::{error::ApiError, state::AppState};

pub const SIGNATURE_HEADER: &str = "billing-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}

/// Receive a billing provider event.
///
/// The body must stay raw for signature verification; axum's `Json` extractor
/// would re-serialize and break the HMAC. 4xx means the payload itself is bad
/// and redelivery is pointless; 5xx means a transient failure the provider
/// should redeliver.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidSignature)?;

    verify_signature(&body, signature, &state.config.billing_webhook_secret)?;

    let event = ParsedEvent::parse(&body)?;

    let reconciler = WebhookReconciler::new(state.store.clone(), state.catalog.clone());
    let outcome = reconciler.reconcile(&event).await?;

    Ok(Json(WebhookResponse {
        received: true,
        outcome: match outcome {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::NoOp => "no_op",
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Unrecognized => "unrecognized",
        },
    }))
}
