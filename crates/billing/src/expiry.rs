//! Expiry notifier
//!
//! Warns every user of a company whose subscription runs out within the next three
//! days. Runs are triggered externally and may overlap, so each user gets at most
//! one warning per UTC day.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::notify::{NotificationSink, KIND_WARNING};
use crate::period::start_of_day;
use crate::store::{BillingStore, SubscriptionRecord};
use crate::subscriptions::SubscriptionState;

pub const EXPIRY_NOTICE_TITLE: &str = "Subscription expiring soon";

/// Days ahead a subscription counts as expiring
pub const EXPIRY_WINDOW_DAYS: i64 = 3;
/// Extra day so a late or skipped run does not miss a subscription
pub const EXPIRY_TOLERANCE_DAYS: i64 = 1;

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryReport {
    pub subscriptions: usize,
    pub notified: usize,
    pub already_notified: usize,
}

#[derive(Clone)]
pub struct ExpiryNotifier {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl ExpiryNotifier {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { store, notifier }
    }

    pub async fn check_expiring_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<ExpiryReport> {
        let until = now + Duration::days(EXPIRY_WINDOW_DAYS + EXPIRY_TOLERANCE_DAYS);
        let today = start_of_day(now);

        let expiring: Vec<SubscriptionRecord> = self
            .store
            .expiring_subscriptions(now, until)
            .await?
            .into_iter()
            .filter(|r| !matches!(r.state(), SubscriptionState::AwaitingPayment { .. }))
            .collect();

        let mut report = ExpiryReport {
            subscriptions: expiring.len(),
            ..ExpiryReport::default()
        };

        for subscription in &expiring {
            let Some(period_end) = subscription.current_period_end else {
                continue;
            };
            let message = self.message_for(subscription, period_end, now).await;

            for user_id in self.store.company_user_ids(subscription.company_id).await? {
                match self
                    .notifier
                    .notify_once_since(user_id, EXPIRY_NOTICE_TITLE, &message, KIND_WARNING, today)
                    .await
                {
                    Ok(true) => report.notified += 1,
                    Ok(false) => report.already_notified += 1,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Failed to send expiry notice");
                    }
                }
            }
        }

        tracing::info!(
            subscriptions = report.subscriptions,
            notified = report.notified,
            already_notified = report.already_notified,
            "Expiry sweep complete"
        );
        Ok(report)
    }

    async fn message_for(
        &self,
        subscription: &SubscriptionRecord,
        period_end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> String {
        let seconds = (period_end - now).whole_seconds().max(0);
        let days_left = (seconds + 86_399) / 86_400;

        let plan_name = match self.store.get_plan(subscription.plan_id).await {
            Ok(Some(plan)) => plan.name,
            _ => "current".to_string(),
        };
        let noun = match subscription.state() {
            SubscriptionState::Trialing { .. } => "trial",
            _ => "subscription",
        };

        format!(
            "Your {} {} ends in {} day(s), on {}. Renew to keep access.",
            plan_name,
            noun,
            days_left,
            period_end.date()
        )
    }
}
