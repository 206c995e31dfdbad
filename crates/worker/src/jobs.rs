//! Scheduled billing jobs
//!
//! Each job calls one engine entry point, logs its counts and swallows errors so a
//! failed run never takes the scheduler down. The next tick retries.

use dealflow_billing::{BillingService, ExpiryReport, SyncReport};
use time::OffsetDateTime;
use tracing::{error, info};

/// Default schedules (seconds-resolution cron, UTC)
pub const DEFAULT_EXPIRY_SWEEP_CRON: &str = "0 0 9 * * *";
pub const DEFAULT_STALE_INVOICE_CRON: &str = "0 0 3 * * *";
pub const DEFAULT_PAYMENT_SYNC_CRON: &str = "0 */15 * * * *";

/// Warn users whose subscription is about to run out
pub async fn run_expiry_sweep(billing: &BillingService, now: OffsetDateTime) -> Option<ExpiryReport> {
    match billing.expiry.check_expiring_subscriptions(now).await {
        Ok(report) => {
            info!(
                subscriptions = report.subscriptions,
                notified = report.notified,
                already_notified = report.already_notified,
                "Expiry sweep finished"
            );
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Expiry sweep failed");
            None
        }
    }
}

/// Fail PENDING invoices past their time-to-live
pub async fn run_stale_invoice_sweep(billing: &BillingService, now: OffsetDateTime) -> Option<u64> {
    match billing.invoices.expire_stale_invoices(now).await {
        Ok(expired) => {
            info!(
                expired = expired,
                ttl_days = billing.config.invoice_ttl_days,
                "Stale invoice sweep finished"
            );
            Some(expired)
        }
        Err(e) => {
            error!(error = %e, "Stale invoice sweep failed");
            None
        }
    }
}

/// Poll the provider for every company still waiting on a payment
pub async fn run_payment_sync(billing: &BillingService, now: OffsetDateTime) -> Option<SyncReport> {
    match billing.payments.sync_all_pending_payments(now).await {
        Ok(report) => {
            if report.companies > 0 {
                info!(
                    companies = report.companies,
                    activated = report.activated,
                    failed = report.failed,
                    "Payment sync finished"
                );
            }
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Payment sync failed");
            None
        }
    }
}
