//! API routes

pub mod billing;
pub mod health;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Owner-facing billing routes; caller identity comes from the gateway
    let billing_routes = Router::new()
        .route("/billing/status", get(billing::get_status))
        .route("/billing/trial", post(billing::start_trial))
        .route("/billing/redeem", post(billing::redeem_code))
        .route("/billing/usage", get(billing::check_usage));

    // Provider-facing webhook route (signature verification, no gateway auth)
    let webhook_routes = Router::new().route("/webhooks/billing", post(webhooks::billing_webhook));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api", billing_routes)
        // Webhook payloads are small; anything larger is not ours
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
