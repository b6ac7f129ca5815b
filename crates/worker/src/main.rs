//! Impactline Background Worker
//!
//! Handles scheduled jobs:
//! - Webhook event log retention pruning (daily at 3:30 UTC)
//! - Observational expired-trial sweep (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;

use impactline_entitlement::{EntitlementStore, PgEntitlementStore};
use impactline_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// How long processed webhook events stay in the ledger before pruning.
const DEFAULT_RETENTION_DAYS: i64 = 30;

fn retention_days() -> i64 {
    std::env::var("WEBHOOK_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Impactline Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let store = Arc::new(PgEntitlementStore::new(pool.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Prune old webhook events daily at 3:30 UTC.
    // The ledger only needs to cover the provider's redelivery horizon.
    let prune_store = store.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let store = prune_store.clone();
            Box::pin(async move {
                let days = retention_days();
                info!(retention_days = days, "Running webhook event log pruning");
                match store.prune_event_log(days).await {
                    Ok(pruned) => info!(pruned = pruned, "Webhook event log pruning complete"),
                    Err(e) => error!(error = %e, "Webhook event log pruning failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event log pruning (daily at 3:30 UTC)");

    // Job 2: Expired-trial sweep (hourly, observational).
    // Expiry is derived at read time; this job only reports, never writes.
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = sweep_pool.clone();
            Box::pin(async move {
                let expired: Result<(i64,), sqlx::Error> = sqlx::query_as(
                    "SELECT COUNT(*) FROM entitlements \
                     WHERE status = 'trial' AND trial_ends_at < NOW()",
                )
                .fetch_one(&pool)
                .await;

                match expired {
                    Ok((count,)) => {
                        info!(expired_trials = count, "Expired trial sweep complete")
                    }
                    Err(e) => error!(error = %e, "Expired trial sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expired trial sweep (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    // Park the main task; jobs run on the scheduler's tasks
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    Ok(())
}
