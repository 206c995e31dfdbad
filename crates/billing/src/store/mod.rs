//! Storage seam for billing state
//!
//! Every multi-row transition the engine performs (allocate a number and create an
//! invoice, settle an invoice and activate its subscription, merge a renewal) is a
//! single method here, so an implementation can make it atomic.
//!
//! [`PgBillingStore`] is the production implementation. [`memory::MemoryBillingStore`]
//! mirrors its semantics for tests.

use async_trait::async_trait;
use dealflow_shared::{BillingInterval, InvoiceStatus, LegalForm, PaymentPeriod, PlanSlug, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{BillingEvent, NewBillingEvent};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod postgres;

pub use postgres::PgBillingStore;

// =============================================================================
// Records
// =============================================================================

/// Catalog row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    pub slug: PlanSlug,
    pub name: String,
    pub price_per_month: i64,
    pub currency: String,
    /// `None` = unlimited
    pub user_limit: Option<i32>,
    pub contact_limit: Option<i32>,
    pub pipeline_limit: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price_per_month == 0
    }
}

/// Catalog row to seed
#[derive(Debug, Clone)]
pub struct PlanSeed {
    pub slug: PlanSlug,
    pub name: String,
    pub price_per_month: i64,
    pub currency: String,
    pub user_limit: Option<i32>,
    pub contact_limit: Option<i32>,
    pub pipeline_limit: Option<i32>,
}

/// The billable tenant, as far as billing cares
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub legal_form: LegalForm,
}

/// Stored subscription row plus the newest PENDING invoice linked to it
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub company_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_interval: BillingInterval,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    pub external_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    /// Derived when the row is read, never stored
    pub pending_invoice_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub company_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub company_id: Uuid,
    pub invoice_number: String,
    pub payment_period_months: i32,
    pub amount: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub external_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Invoice {
    pub fn is_pending(&self) -> bool {
        self.status == InvoiceStatus::Pending
    }

    /// Months of access this invoice buys; stored values are constrained to 1/3/6/12
    pub fn months(&self) -> u32 {
        PaymentPeriod::try_from(self.payment_period_months)
            .map(|p| p.months())
            .unwrap_or(1)
    }
}

/// Invoice to create together with its pending-activation subscription row
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub company_id: Uuid,
    pub plan_id: Uuid,
    pub payment_period: PaymentPeriod,
    pub amount: i64,
    pub currency: String,
    /// Provisional end of the period the invoice pays for
    pub period_end: OffsetDateTime,
    /// Determines the date part of the invoice number
    pub issued_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInvoice {
    pub subscription: SubscriptionRecord,
    pub invoice: Invoice,
}

/// Outcome of a PENDING → PAID transition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub invoice: Invoice,
    pub subscription: SubscriptionRecord,
}

/// Result of failing stale invoices
#[derive(Debug, Clone, Default)]
pub struct StaleSweep {
    pub invoices: Vec<Invoice>,
    /// Pending-activation rows canceled because their last PENDING invoice expired
    pub abandoned_subscriptions: Vec<Uuid>,
}

// =============================================================================
// Store
// =============================================================================

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Cheap connectivity check for readiness
    async fn ping(&self) -> BillingResult<()>;

    // --- Catalog ---------------------------------------------------------------

    /// Insert a plan unless its slug already exists. Returns true if inserted.
    async fn insert_plan_if_missing(&self, seed: &PlanSeed) -> BillingResult<bool>;
    /// All plans, cheapest first
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    // --- Tenants ---------------------------------------------------------------

    async fn get_company(&self, company_id: Uuid) -> BillingResult<Option<Company>>;
    async fn company_user_ids(&self, company_id: Uuid) -> BillingResult<Vec<Uuid>>;

    // --- Subscriptions ---------------------------------------------------------

    /// Every subscription of a company, newest first
    async fn list_subscriptions(&self, company_id: Uuid)
        -> BillingResult<Vec<SubscriptionRecord>>;
    async fn insert_subscription(&self, new: NewSubscription) -> BillingResult<SubscriptionRecord>;
    /// Switch the plan of a genuine trial in place. Guarded: the row must still be a
    /// TRIAL with `trial_ends_at > now` and no PENDING invoice; returns `None` otherwise.
    async fn switch_trial_plan(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;
    /// ACTIVE or TRIAL rows with `after < current_period_end <= until`
    async fn expiring_subscriptions(
        &self,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>>;
    /// TRIAL rows carrying a provider payment id, i.e. waiting for an instant payment
    async fn awaiting_provider(&self, company_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>>;
    async fn companies_awaiting_provider(&self) -> BillingResult<Vec<Uuid>>;
    /// Activate a row waiting for a provider payment: ACTIVE, period end
    /// `paid_at + months`, linked PENDING invoices PAID. `None` if the row is no longer
    /// waiting, or if it has invoices and none of them is PENDING any more.
    async fn activate_awaiting(
        &self,
        subscription_id: Uuid,
        months: u32,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;
    /// Fold a paid pending row into an active one: extend the active row's period end by
    /// `months`, anchored at the later of `paid_at` and its current end, move the pending
    /// row's invoices over (PENDING ones become PAID) and delete the pending row.
    /// `None` if the pending row is gone, its invoices were all closed without payment,
    /// or the active row is no longer ACTIVE.
    async fn merge_renewal(
        &self,
        pending_subscription_id: Uuid,
        active_subscription_id: Uuid,
        months: u32,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;
    /// Cancel a row whose provider payment was canceled. Returns false if it was not waiting.
    async fn abandon_awaiting(&self, subscription_id: Uuid) -> BillingResult<bool>;

    // --- Invoices --------------------------------------------------------------

    /// Allocate the next invoice number for `new.issued_at`'s date, then create the
    /// pending-activation TRIAL row and the PENDING invoice, atomically.
    async fn create_pending_invoice(&self, new: NewInvoice) -> BillingResult<PendingInvoice>;
    /// Record the provider payment id on the invoice and its subscription
    async fn attach_external_payment(&self, invoice_id: Uuid, payment_id: &str)
        -> BillingResult<()>;
    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;
    async fn find_invoice_by_external_id(&self, external_id: &str)
        -> BillingResult<Option<Invoice>>;
    /// PENDING invoices of exactly `amount`, newest first
    async fn pending_invoices_with_amount(&self, amount: i64) -> BillingResult<Vec<Invoice>>;
    /// Invoices of a company, newest first
    async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>>;
    /// PENDING → PAID plus subscription ACTIVE with period end `paid_at + invoice months`,
    /// atomically. `None` when the invoice is not PENDING (already processed).
    async fn settle_invoice(
        &self,
        invoice_id: Uuid,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>>;
    /// PENDING → FAILED. `None` when the invoice is not PENDING.
    async fn fail_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;
    /// Mark every PENDING invoice created before `created_before` as FAILED and cancel
    /// the pending-activation rows left without a PENDING invoice, atomically
    async fn fail_stale_invoices(&self, created_before: OffsetDateTime)
        -> BillingResult<StaleSweep>;

    // --- Audit -----------------------------------------------------------------

    async fn record_event(&self, event: NewBillingEvent) -> BillingResult<Uuid>;
    async fn list_events(&self, company_id: Uuid, limit: i64) -> BillingResult<Vec<BillingEvent>>;
}
