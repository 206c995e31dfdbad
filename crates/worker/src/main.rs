#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Dealflow billing worker
//!
//! Cron process that drives the billing engine: expiry notices, stale invoice
//! expiry and provider polling.

mod jobs;

use std::env;

use anyhow::Context;
use dealflow_billing::BillingService;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct WorkerConfig {
    database_url: String,
    database_max_connections: u32,
    json_logs: bool,
    expiry_sweep_cron: String,
    stale_invoice_cron: String,
    payment_sync_cron: String,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a number")?,
            json_logs: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            expiry_sweep_cron: env::var("EXPIRY_SWEEP_CRON")
                .unwrap_or_else(|_| jobs::DEFAULT_EXPIRY_SWEEP_CRON.to_string()),
            stale_invoice_cron: env::var("STALE_INVOICE_CRON")
                .unwrap_or_else(|_| jobs::DEFAULT_STALE_INVOICE_CRON.to_string()),
            payment_sync_cron: env::var("PAYMENT_SYNC_CRON")
                .unwrap_or_else(|_| jobs::DEFAULT_PAYMENT_SYNC_CRON.to_string()),
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dealflow=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Dealflow billing worker");

    let pool: sqlx::PgPool =
        dealflow_shared::create_pool(&config.database_url, config.database_max_connections)
            .await
            .context("Failed to connect to database")?;
    dealflow_shared::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let billing = BillingService::from_env(pool.clone()).context("Failed to configure billing")?;

    let mut scheduler = JobScheduler::new().await?;

    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.expiry_sweep_cron.as_str(), move |_id, _sched| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                jobs::run_expiry_sweep(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;

    let stale_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.stale_invoice_cron.as_str(), move |_id, _sched| {
            let billing = stale_billing.clone();
            Box::pin(async move {
                jobs::run_stale_invoice_sweep(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;

    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.payment_sync_cron.as_str(), move |_id, _sched| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                jobs::run_payment_sync(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!(
        expiry = %config.expiry_sweep_cron,
        stale_invoices = %config.stale_invoice_cron,
        payment_sync = %config.payment_sync_cron,
        "Scheduler started"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    scheduler.shutdown().await?;
    pool.close().await;
    tracing::info!("Dealflow billing worker stopped");
    Ok(())
}
