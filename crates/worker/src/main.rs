//! Lingkar Background Worker
//!
//! Runs the scheduled lifecycle sweeps the billing core leaves to the clock:
//! - Subscription expiry for coverage past `ends_at` (hourly)
//! - Tenant expiry for paid coverage past `active_until` (hourly)
//! - Trial expiry for trials past `trial_ends_at` (hourly)
//! - Stale invoice cancellation for unpaid invoices long past due (daily at 3:00 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::time::Duration;

use anyhow::Context;
use lingkar_shared::db::create_pool;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Flip active subscriptions whose coverage window has closed. Perpetual
/// subscriptions carry NULL `ends_at` and are never touched.
async fn expire_lapsed_subscriptions(pool: &PgPool) {
    let result: Result<Vec<(Uuid, Uuid)>, sqlx::Error> = sqlx::query_as(
        r#"
        UPDATE subscriptions
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'active'
          AND ends_at IS NOT NULL
          AND ends_at <= NOW()
        RETURNING id, tenant_id
        "#,
    )
    .fetch_all(pool)
    .await;

    match result {
        Ok(rows) => {
            for (subscription_id, tenant_id) in &rows {
                info!(
                    subscription_id = %subscription_id,
                    tenant_id = %tenant_id,
                    "Subscription coverage window closed; marked expired"
                );
            }
            info!(expired = rows.len(), "Subscription expiry sweep complete");
        }
        Err(e) => error!(error = %e, "Subscription expiry sweep failed"),
    }
}

/// Expire tenants whose paid coverage has lapsed.
async fn expire_lapsed_tenants(pool: &PgPool) {
    let result: Result<Vec<(Uuid, String)>, sqlx::Error> = sqlx::query_as(
        r#"
        UPDATE tenants
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'active'
          AND active_until IS NOT NULL
          AND active_until <= NOW()
        RETURNING id, name
        "#,
    )
    .fetch_all(pool)
    .await;

    match result {
        Ok(rows) => {
            for (tenant_id, name) in &rows {
                warn!(
                    tenant_id = %tenant_id,
                    name = %name,
                    "Tenant coverage lapsed; marked expired"
                );
            }
            info!(expired = rows.len(), "Tenant expiry sweep complete");
        }
        Err(e) => error!(error = %e, "Tenant expiry sweep failed"),
    }
}

/// Expire trial tenants whose trial window has ended. The billing-status
/// read path already reports these as expired point-in-time; the sweep
/// makes the flip durable.
async fn expire_lapsed_trials(pool: &PgPool) {
    let result: Result<Vec<(Uuid, String)>, sqlx::Error> = sqlx::query_as(
        r#"
        UPDATE tenants
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'trial'
          AND trial_ends_at IS NOT NULL
          AND trial_ends_at <= NOW()
        RETURNING id, name
        "#,
    )
    .fetch_all(pool)
    .await;

    match result {
        Ok(rows) => {
            for (tenant_id, name) in &rows {
                info!(tenant_id = %tenant_id, name = %name, "Trial ended; marked expired");
            }
            info!(expired = rows.len(), "Trial expiry sweep complete");
        }
        Err(e) => error!(error = %e, "Trial expiry sweep failed"),
    }
}

/// Cancel unpaid invoices that sat past due longer than the grace window.
/// The subscription they would have activated stays `unpaid`; a later
/// purchase issues a fresh invoice.
async fn cancel_stale_invoices(pool: &PgPool, grace_days: i32) {
    let result: Result<Vec<(Uuid, String)>, sqlx::Error> = sqlx::query_as(
        r#"
        UPDATE invoices
        SET status = 'canceled', updated_at = NOW()
        WHERE status = 'unpaid'
          AND due_at <= NOW() - make_interval(days => $1)
        RETURNING id, number
        "#,
    )
    .bind(grace_days)
    .fetch_all(pool)
    .await;

    match result {
        Ok(rows) => {
            for (invoice_id, number) in &rows {
                info!(
                    invoice_id = %invoice_id,
                    invoice_number = %number,
                    "Canceled stale unpaid invoice"
                );
            }
            info!(canceled = rows.len(), "Stale invoice sweep complete");
        }
        Err(e) => error!(error = %e, "Stale invoice sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Lingkar worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url, 5).await?;

    // Days an unpaid invoice may sit past its due date before the sweep
    // cancels it.
    let grace_days = std::env::var("STALE_INVOICE_GRACE_DAYS")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(30);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Subscription expiry sweep (hourly at :00)
    let subscription_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = subscription_pool.clone();
            Box::pin(async move {
                info!("Running subscription expiry sweep");
                expire_lapsed_subscriptions(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: subscription expiry sweep (hourly)");

    // Job 2: Tenant expiry sweep (hourly at :10)
    // Runs after the subscription sweep so both flips land within the hour.
    let tenant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let pool = tenant_pool.clone();
            Box::pin(async move {
                info!("Running tenant expiry sweep");
                expire_lapsed_tenants(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: tenant expiry sweep (hourly)");

    // Job 3: Trial expiry sweep (hourly at :20)
    let trial_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 20 * * * *", move |_uuid, _l| {
            let pool = trial_pool.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                expire_lapsed_trials(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: trial expiry sweep (hourly)");

    // Job 4: Stale invoice cancellation (daily at 3:00 UTC)
    let invoice_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = invoice_pool.clone();
            Box::pin(async move {
                info!(grace_days = grace_days, "Running stale invoice sweep");
                cancel_stale_invoices(&pool, grace_days).await;
            })
        })?)
        .await?;
    info!("Scheduled: stale invoice sweep (daily at 3:00 UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Lingkar worker started with {} scheduled jobs", 5);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
