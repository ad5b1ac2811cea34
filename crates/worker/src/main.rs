//! CreatorPay Background Worker
//!
//! Handles scheduled jobs:
//! - Ledger invariant checks (hourly)
//! - Processed webhook record pruning (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use creatorpay_settlement::{
    BroadcastHub, ChannelPublisher, HttpChannelPublisher, InvariantCheckSummary, PgLedger,
    SettlementConfig, SettlementService, StripeClient,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log results of an invariant run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );

    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            payment_intent_ids = ?violation.payment_intent_ids,
            description = %violation.description,
            "Ledger invariant violated"
        );
    }
}

async fn create_settlement(config: SettlementConfig) -> anyhow::Result<SettlementService> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let ledger = PgLedger::connect(&database_url, 5).await?;
    info!("Database pool created");

    let publisher: Arc<dyn ChannelPublisher> = match config.pubsub.clone() {
        Some(pubsub) => Arc::new(HttpChannelPublisher::new(pubsub)?),
        None => {
            warn!("PUBSUB_URL not set; admin alerts from the worker are logged only");
            Arc::new(BroadcastHub::new())
        }
    };

    let gateway = Arc::new(StripeClient::new(config.stripe.clone()));
    Ok(SettlementService::new(config, gateway, Arc::new(ledger), publisher)?)
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

    info!("Starting CreatorPay Worker");

    let config = SettlementConfig::from_env()?;
    let settlement = Arc::new(create_settlement(config).await?);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Ledger invariant checks (hourly, on the hour)
    let invariant_service = settlement.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = invariant_service.clone();
            Box::pin(async move {
                info!("Running scheduled ledger invariant checks");
                match service.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (hourly)");

    // Job 2: Prune processed webhook records past retention (daily at 3:00 AM UTC)
    let prune_service = settlement.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let service = prune_service.clone();
            Box::pin(async move {
                info!("Running processed webhook record cleanup");
                if let Err(e) = service.prune_webhook_records().await {
                    error!(error = %e, "Processed webhook record cleanup failed");
                }
            })
        })?)
        .await?;
    info!(
        retention_days = settlement.config().webhook_retention_days,
        "Scheduled: Processed webhook record cleanup (daily at 3:00 AM UTC)"
    );

    // Job 3: Health check heartbeat (every 5 minutes)
    let heartbeat_service = settlement.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = heartbeat_service.clone();
            Box::pin(async move {
                match service.ledger.health_check().await {
                    Ok(()) => info!("Worker heartbeat - all systems operational"),
                    Err(e) => error!(error = %e, "Worker heartbeat - ledger unreachable"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("CreatorPay Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
