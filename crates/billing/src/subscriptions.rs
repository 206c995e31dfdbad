//! Subscription state resolver and plan changes
//!
//! The stored status is `TRIAL | ACTIVE | PAST_DUE | CANCELED`, where `TRIAL` is used
//! both for a genuine trial and for a row waiting for its first payment. Every
//! decision here is made on the decoded [`SubscriptionState`] instead, so a row with
//! an open invoice can never be mistaken for a trial.
//!
//! ## Resolution order
//!
//! 1. ACTIVE with no period end, or a period end after `now`
//! 2. a genuine trial whose `trial_ends_at` is after `now`
//! 3. nothing
//!
//! Within a step the most recently created row wins.

use std::sync::Arc;

use dealflow_shared::SubscriptionStatus;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{PlanCatalog, TRIAL_DAYS};
use crate::error::{BillingError, BillingResult};
use crate::events::{log_event, ActorType, BillingEventBuilder, BillingEventType};
use crate::proration::{calculate_prorated_period_end, Proration, DAYS_IN_BILLING_MONTH};
use crate::store::{BillingStore, NewSubscription, Plan, SubscriptionRecord};

/// Decoded state of a subscription row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SubscriptionState {
    /// Paid or free access. `None` never expires.
    Active {
        #[serde(with = "time::serde::rfc3339::option")]
        period_end: Option<OffsetDateTime>,
    },
    /// Genuine trial
    Trialing {
        #[serde(with = "time::serde::rfc3339")]
        ends_at: OffsetDateTime,
    },
    /// Waiting for the first payment of an invoice; grants no access
    AwaitingPayment { invoice_id: Option<Uuid> },
    PastDue,
    Canceled,
}

impl SubscriptionState {
    /// Whether this state grants access at `now`
    pub fn is_effective_at(&self, now: OffsetDateTime) -> bool {
        match self {
            SubscriptionState::Active { period_end } => period_end.map_or(true, |end| end > now),
            SubscriptionState::Trialing { ends_at } => *ends_at > now,
            SubscriptionState::AwaitingPayment { .. }
            | SubscriptionState::PastDue
            | SubscriptionState::Canceled => false,
        }
    }
}

impl SubscriptionRecord {
    /// Decode the stored status into a [`SubscriptionState`]
    pub fn state(&self) -> SubscriptionState {
        match self.status {
            SubscriptionStatus::Active => SubscriptionState::Active {
                period_end: self.current_period_end,
            },
            SubscriptionStatus::Trial => match (self.pending_invoice_id, self.trial_ends_at) {
                (None, Some(ends_at)) => SubscriptionState::Trialing { ends_at },
                (invoice_id, _) => SubscriptionState::AwaitingPayment { invoice_id },
            },
            SubscriptionStatus::PastDue => SubscriptionState::PastDue,
            SubscriptionStatus::Canceled => SubscriptionState::Canceled,
        }
    }
}

/// Pick the effective subscription out of all rows of one company
pub fn resolve_effective(
    records: &[SubscriptionRecord],
    now: OffsetDateTime,
) -> Option<&SubscriptionRecord> {
    let newest_effective = |want_active: bool| {
        records
            .iter()
            .filter(|r| {
                let state = r.state();
                let is_active = matches!(state, SubscriptionState::Active { .. });
                let is_trial = matches!(state, SubscriptionState::Trialing { .. });
                (if want_active { is_active } else { is_trial }) && state.is_effective_at(now)
            })
            .max_by_key(|r| r.created_at)
    };

    newest_effective(true).or_else(|| newest_effective(false))
}

/// The effective subscription together with its plan
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveSubscription {
    pub subscription: SubscriptionRecord,
    pub plan: Plan,
    pub state: SubscriptionState,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, catalog: PlanCatalog) -> Self {
        Self { store, catalog }
    }

    async fn effective_record(
        &self,
        company_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let records = self.store.list_subscriptions(company_id).await?;
        Ok(resolve_effective(&records, now).cloned())
    }

    /// The subscription the rest of the system treats as current. Pure read.
    pub async fn resolve_current_subscription(
        &self,
        company_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<EffectiveSubscription>> {
        let Some(subscription) = self.effective_record(company_id, now).await? else {
            return Ok(None);
        };
        let plan = self.catalog.plan_of_record(subscription.plan_id).await?;
        let state = subscription.state();
        Ok(Some(EffectiveSubscription {
            subscription,
            plan,
            state,
        }))
    }

    async fn require_company(&self, company_id: Uuid) -> BillingResult<()> {
        self.store
            .get_company(company_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| BillingError::NotFound(format!("Company {} not found", company_id)))
    }

    /// Activate a free plan directly. Paid plans only become active through payment.
    pub async fn activate_free_plan(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.catalog.get_plan(plan_id).await?;
        if !plan.is_free() {
            return Err(BillingError::PaymentRequired(format!(
                "Plan {} costs {} {} per month; pay through an invoice or an instant payment",
                plan.slug, plan.price_per_month, plan.currency
            )));
        }
        self.require_company(company_id).await?;

        let record = self
            .store
            .insert_subscription(NewSubscription {
                company_id,
                plan_id,
                status: SubscriptionStatus::Active,
                current_period_end: None,
                trial_ends_at: None,
            })
            .await?;

        tracing::info!(
            company_id = %company_id,
            plan = %plan.slug,
            subscription_id = %record.id,
            "Free plan activated"
        );
        log_event(
            self.store.as_ref(),
            with_actor(
                BillingEventBuilder::new(company_id, BillingEventType::FreePlanActivated),
                actor_id,
            )
            .data(serde_json::json!({
                "subscription_id": record.id,
                "plan": plan.slug,
            })),
        )
        .await;

        Ok(record)
    }

    /// Start a genuine trial of a paid plan. Allowed once per company, and only when
    /// nothing else is effective.
    pub async fn start_trial(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
        actor_id: Option<Uuid>,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.catalog.get_plan(plan_id).await?;
        if plan.is_free() {
            return Err(BillingError::Validation(format!(
                "Plan {} is free and needs no trial",
                plan.slug
            )));
        }
        self.require_company(company_id).await?;

        let records = self.store.list_subscriptions(company_id).await?;
        if records.iter().any(|r| r.trial_ends_at.is_some()) {
            return Err(BillingError::Validation(
                "This company has already used its trial".to_string(),
            ));
        }
        if resolve_effective(&records, now).is_some() {
            return Err(BillingError::Validation(
                "This company already has an effective subscription".to_string(),
            ));
        }

        let ends_at = now + Duration::days(TRIAL_DAYS);
        let record = self
            .store
            .insert_subscription(NewSubscription {
                company_id,
                plan_id,
                status: SubscriptionStatus::Trial,
                current_period_end: Some(ends_at),
                trial_ends_at: Some(ends_at),
            })
            .await?;

        tracing::info!(company_id = %company_id, plan = %plan.slug, "Trial started");
        log_event(
            self.store.as_ref(),
            with_actor(
                BillingEventBuilder::new(company_id, BillingEventType::TrialStarted),
                actor_id,
            )
            .data(serde_json::json!({
                "subscription_id": record.id,
                "plan": plan.slug,
                "trial_ends_at": ends_at.unix_timestamp(),
            })),
        )
        .await;

        Ok(record)
    }

    /// Switch the plan of the running trial without touching its end
    pub async fn update_trial_plan(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
        actor_id: Option<Uuid>,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.catalog.get_plan(plan_id).await?;
        if plan.is_free() {
            return Err(BillingError::Validation(format!(
                "Plan {} is free; activate it directly instead",
                plan.slug
            )));
        }

        let trial = self
            .effective_record(company_id, now)
            .await?
            .filter(|r| matches!(r.state(), SubscriptionState::Trialing { .. }))
            .ok_or_else(|| BillingError::NoActiveTrial(company_id.to_string()))?;

        // Guarded again in the store in case an invoice appeared meanwhile
        let record = self
            .store
            .switch_trial_plan(trial.id, plan_id, now)
            .await?
            .ok_or_else(|| BillingError::NoActiveTrial(company_id.to_string()))?;

        tracing::info!(
            company_id = %company_id,
            subscription_id = %record.id,
            plan = %plan.slug,
            "Trial plan changed"
        );
        log_event(
            self.store.as_ref(),
            with_actor(
                BillingEventBuilder::new(company_id, BillingEventType::TrialPlanChanged),
                actor_id,
            )
            .data(serde_json::json!({
                "subscription_id": record.id,
                "from_plan_id": trial.plan_id,
                "to_plan": plan.slug,
            })),
        )
        .await;

        Ok(record)
    }

    /// What switching the effective paid subscription to `plan_id` at `now` would do.
    /// Nothing is written.
    pub async fn preview_proration(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Proration> {
        let target = self.catalog.get_plan(plan_id).await?;
        let current = self.effective_record(company_id, now).await?;

        let Some((record, period_end)) = current.and_then(|r| match r.state() {
            SubscriptionState::Active {
                period_end: Some(end),
            } => Some((r, end)),
            _ => None,
        }) else {
            return Err(BillingError::Validation(
                "No paid period to prorate".to_string(),
            ));
        };

        let current_plan = self.catalog.plan_of_record(record.plan_id).await?;
        calculate_prorated_period_end(
            now,
            period_end,
            current_plan.price_per_month,
            target.price_per_month,
            DAYS_IN_BILLING_MONTH,
        )
    }
}

fn with_actor(builder: BillingEventBuilder, actor_id: Option<Uuid>) -> BillingEventBuilder {
    match actor_id {
        Some(id) => builder.actor(id, ActorType::User),
        None => builder.actor_type(ActorType::User),
    }
}
