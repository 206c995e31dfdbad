//! Billing Events Module
//!
//! Append-only audit trail of billing transitions. Events answer
//! "why does this company have (or not have) access?" after the fact.
//!
//! Logging an event never fails the operation that triggered it.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::BillingStore;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    TrialStarted,
    TrialPlanChanged,
    FreePlanActivated,
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionAbandoned,

    // Invoicing
    InvoiceCreated,
    InvoicePaid,
    InvoiceFailed,
    InvoiceExpired,

    // Reconciliation
    PaymentAnomaly,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::TrialPlanChanged => "TRIAL_PLAN_CHANGED",
            BillingEventType::FreePlanActivated => "FREE_PLAN_ACTIVATED",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            BillingEventType::SubscriptionAbandoned => "SUBSCRIPTION_ABANDONED",
            BillingEventType::InvoiceCreated => "INVOICE_CREATED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoiceFailed => "INVOICE_FAILED",
            BillingEventType::InvoiceExpired => "INVOICE_EXPIRED",
            BillingEventType::PaymentAnomaly => "PAYMENT_ANOMALY",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Tenant user through the UI
    User,
    /// Scheduled sweep or internal automation
    System,
    /// Instant payment provider (webhook or poll)
    Provider,
    /// Bank statement webhook
    Bank,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Provider => write!(f, "provider"),
            ActorType::Bank => write!(f, "bank"),
        }
    }
}

/// A stored billing event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    pub id: Uuid,
    pub company_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Event ready to be appended
#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    pub company_id: Uuid,
    pub event_type: BillingEventType,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    company_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(company_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            company_id,
            event_type,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> NewBillingEvent {
        NewBillingEvent {
            company_id: self.company_id,
            event_type: self.event_type,
            event_data: self.event_data,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
        }
    }
}

/// Append an event, logging instead of failing
pub async fn log_event(store: &dyn BillingStore, builder: BillingEventBuilder) {
    let event = builder.build();
    let (company_id, event_type) = (event.company_id, event.event_type);
    if let Err(e) = store.record_event(event).await {
        tracing::warn!(
            company_id = %company_id,
            event_type = %event_type,
            error = %e,
            "Failed to log billing event"
        );
    }
}
