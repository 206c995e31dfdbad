//! In-memory billing store for tests.
//!
//! All state sits behind one mutex, so every trait method is atomic exactly like the
//! transactional PostgreSQL implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dealflow_shared::{BillingInterval, InvoiceStatus, LegalForm, SubscriptionStatus};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    BillingStore, Company, Invoice, NewInvoice, NewSubscription, PendingInvoice, Plan, PlanSeed,
    Settlement, StaleSweep, SubscriptionRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, NewBillingEvent};
use crate::numbering::format_invoice_number;
use crate::period::add_months;

/// In-memory billing store.
///
/// Wraps data in Arc for cheap cloning.
#[derive(Default, Clone)]
pub struct MemoryBillingStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    plans: Vec<Plan>,
    companies: HashMap<Uuid, Company>,
    /// (user_id, company_id) in insertion order
    users: Vec<(Uuid, Uuid)>,
    subscriptions: Vec<SubscriptionRecord>,
    invoices: Vec<Invoice>,
    counters: HashMap<Date, u32>,
    events: Vec<BillingEvent>,
    last_timestamp: Option<OffsetDateTime>,
}

impl State {
    /// Strictly increasing wall-clock timestamp, so creation order is never ambiguous
    fn tick(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let next = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(next);
        next
    }

    fn pending_invoice_id(&self, subscription_id: Uuid) -> Option<Uuid> {
        self.invoices
            .iter()
            .filter(|i| i.subscription_id == subscription_id && i.is_pending())
            .max_by_key(|i| i.created_at)
            .map(|i| i.id)
    }

    fn read_subscription(&self, subscription_id: Uuid) -> Option<SubscriptionRecord> {
        self.subscriptions
            .iter()
            .find(|s| s.id == subscription_id)
            .map(|s| self.with_pending(s))
    }

    fn with_pending(&self, record: &SubscriptionRecord) -> SubscriptionRecord {
        SubscriptionRecord {
            pending_invoice_id: self.pending_invoice_id(record.id),
            ..record.clone()
        }
    }

    fn subscription_mut(&mut self, subscription_id: Uuid) -> Option<&mut SubscriptionRecord> {
        self.subscriptions.iter_mut().find(|s| s.id == subscription_id)
    }

    fn is_awaiting_provider(record: &SubscriptionRecord) -> bool {
        record.status == SubscriptionStatus::Trial && record.external_subscription_id.is_some()
    }

    /// The row has invoices and none of them is PENDING any more
    fn invoices_closed(&self, subscription_id: Uuid) -> bool {
        let mut linked = self
            .invoices
            .iter()
            .filter(|i| i.subscription_id == subscription_id)
            .peekable();
        linked.peek().is_some() && !linked.any(Invoice::is_pending)
    }

    fn mark_pending_paid(&mut self, subscription_id: Uuid, paid_at: OffsetDateTime) {
        let now = self.tick();
        for invoice in self
            .invoices
            .iter_mut()
            .filter(|i| i.subscription_id == subscription_id && i.is_pending())
        {
            invoice.status = InvoiceStatus::Paid;
            invoice.paid_at = Some(paid_at);
            invoice.updated_at = now;
        }
    }
}

impl MemoryBillingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a company and return its id
    pub fn add_company(&self, name: &str, legal_form: LegalForm) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().companies.insert(
            id,
            Company {
                id,
                name: name.to_string(),
                legal_form,
            },
        );
        id
    }

    /// Register a user of a company and return its id
    pub fn add_user(&self, company_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().users.push((id, company_id));
        id
    }

    /// Move an invoice's creation time into the past
    pub fn backdate_invoice(&self, invoice_id: Uuid, created_at: OffsetDateTime) {
        let mut state = self.lock();
        if let Some(invoice) = state.invoices.iter_mut().find(|i| i.id == invoice_id) {
            invoice.created_at = created_at;
        }
    }

    /// Overwrite a row's trial end, e.g. to model legacy rows
    pub fn set_trial_end(&self, subscription_id: Uuid, trial_ends_at: Option<OffsetDateTime>) {
        if let Some(record) = self.lock().subscription_mut(subscription_id) {
            record.trial_ends_at = trial_ends_at;
        }
    }

    /// Snapshot of every subscription row, oldest first
    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        let state = self.lock();
        state
            .subscriptions
            .iter()
            .map(|s| state.with_pending(s))
            .collect()
    }

    /// Snapshot of every invoice, oldest first
    pub fn invoices(&self) -> Vec<Invoice> {
        self.lock().invoices.clone()
    }

    /// Snapshot of the audit trail, oldest first
    pub fn events(&self) -> Vec<BillingEvent> {
        self.lock().events.clone()
    }

    /// Set the day's counter as if `value` invoices had already been issued
    pub fn set_daily_counter(&self, date: Date, value: u32) {
        self.lock().counters.insert(date, value);
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn insert_plan_if_missing(&self, seed: &PlanSeed) -> BillingResult<bool> {
        let mut state = self.lock();
        if state.plans.iter().any(|p| p.slug == seed.slug) {
            return Ok(false);
        }
        let now = state.tick();
        state.plans.push(Plan {
            id: Uuid::new_v4(),
            slug: seed.slug,
            name: seed.name.clone(),
            price_per_month: seed.price_per_month,
            currency: seed.currency.clone(),
            user_limit: seed.user_limit,
            contact_limit: seed.contact_limit,
            pipeline_limit: seed.pipeline_limit,
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans = self.lock().plans.clone();
        plans.sort_by_key(|p| (p.price_per_month, p.slug.to_string()));
        Ok(plans)
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.lock().plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn get_company(&self, company_id: Uuid) -> BillingResult<Option<Company>> {
        Ok(self.lock().companies.get(&company_id).cloned())
    }

    async fn company_user_ids(&self, company_id: Uuid) -> BillingResult<Vec<Uuid>> {
        Ok(self
            .lock()
            .users
            .iter()
            .filter(|(_, company)| *company == company_id)
            .map(|(user, _)| *user)
            .collect())
    }

    async fn list_subscriptions(
        &self,
        company_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.lock();
        let mut records: Vec<SubscriptionRecord> = state
            .subscriptions
            .iter()
            .filter(|s| s.company_id == company_id)
            .map(|s| state.with_pending(s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn insert_subscription(&self, new: NewSubscription) -> BillingResult<SubscriptionRecord> {
        let mut state = self.lock();
        let now = state.tick();
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            company_id: new.company_id,
            plan_id: new.plan_id,
            status: new.status,
            billing_interval: BillingInterval::Monthly,
            current_period_end: new.current_period_end,
            trial_ends_at: new.trial_ends_at,
            external_subscription_id: None,
            cancel_at_period_end: false,
            pending_invoice_id: None,
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn switch_trial_plan(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut state = self.lock();
        let has_pending = state.pending_invoice_id(subscription_id).is_some();
        let stamp = state.tick();

        let Some(record) = state.subscription_mut(subscription_id) else {
            return Ok(None);
        };
        let genuine_trial = record.status == SubscriptionStatus::Trial
            && record.trial_ends_at.is_some_and(|ends| ends > now)
            && !has_pending;
        if !genuine_trial {
            return Ok(None);
        }

        record.plan_id = plan_id;
        record.updated_at = stamp;
        Ok(state.read_subscription(subscription_id))
    }

    async fn expiring_subscriptions(
        &self,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.lock();
        let mut records: Vec<SubscriptionRecord> = state
            .subscriptions
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SubscriptionStatus::Active | SubscriptionStatus::Trial
                ) && s
                    .current_period_end
                    .is_some_and(|end| end > after && end <= until)
            })
            .map(|s| state.with_pending(s))
            .collect();
        records.sort_by_key(|s| s.current_period_end);
        Ok(records)
    }

    async fn awaiting_provider(&self, company_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.lock();
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.company_id == company_id && State::is_awaiting_provider(s))
            .map(|s| state.with_pending(s))
            .collect())
    }

    async fn companies_awaiting_provider(&self) -> BillingResult<Vec<Uuid>> {
        let state = self.lock();
        let mut companies: Vec<Uuid> = state
            .subscriptions
            .iter()
            .filter(|s| State::is_awaiting_provider(s))
            .map(|s| s.company_id)
            .collect();
        companies.sort();
        companies.dedup();
        Ok(companies)
    }

    async fn activate_awaiting(
        &self,
        subscription_id: Uuid,
        months: u32,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let period_end = add_months(paid_at, months)?;
        let mut state = self.lock();
        let stamp = state.tick();

        let waiting = state
            .subscriptions
            .iter()
            .any(|s| s.id == subscription_id && State::is_awaiting_provider(s));
        if !waiting || state.invoices_closed(subscription_id) {
            return Ok(None);
        }
        let Some(record) = state.subscription_mut(subscription_id) else {
            return Ok(None);
        };
        record.status = SubscriptionStatus::Active;
        record.current_period_end = Some(period_end);
        record.updated_at = stamp;

        state.mark_pending_paid(subscription_id, paid_at);
        Ok(state.read_subscription(subscription_id))
    }

    async fn merge_renewal(
        &self,
        pending_subscription_id: Uuid,
        active_subscription_id: Uuid,
        months: u32,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut state = self.lock();

        let pending_ok = state
            .subscriptions
            .iter()
            .any(|s| s.id == pending_subscription_id && s.status == SubscriptionStatus::Trial)
            && !state.invoices_closed(pending_subscription_id);
        let active_end = state
            .subscriptions
            .iter()
            .find(|s| s.id == active_subscription_id && s.status == SubscriptionStatus::Active)
            .map(|s| s.current_period_end);

        let (true, Some(current_end)) = (pending_ok, active_end) else {
            return Ok(None);
        };

        let anchor = current_end.map_or(paid_at, |end| end.max(paid_at));
        let new_period_end = add_months(anchor, months)?;

        state.mark_pending_paid(pending_subscription_id, paid_at);
        let stamp = state.tick();
        for invoice in state
            .invoices
            .iter_mut()
            .filter(|i| i.subscription_id == pending_subscription_id)
        {
            invoice.subscription_id = active_subscription_id;
            invoice.updated_at = stamp;
        }
        state
            .subscriptions
            .retain(|s| s.id != pending_subscription_id);

        if let Some(active) = state.subscription_mut(active_subscription_id) {
            active.current_period_end = Some(new_period_end);
            active.updated_at = stamp;
        }
        Ok(state.read_subscription(active_subscription_id))
    }

    async fn abandon_awaiting(&self, subscription_id: Uuid) -> BillingResult<bool> {
        let mut state = self.lock();
        let stamp = state.tick();
        match state.subscription_mut(subscription_id) {
            Some(record) if State::is_awaiting_provider(record) => {
                record.status = SubscriptionStatus::Canceled;
                record.updated_at = stamp;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_pending_invoice(&self, new: NewInvoice) -> BillingResult<PendingInvoice> {
        let mut state = self.lock();
        let date = new.issued_at.date();
        let sequence = state.counters.get(&date).copied().unwrap_or(0) + 1;
        let invoice_number = format_invoice_number(date, sequence)?;
        state.counters.insert(date, sequence);

        let now = state.tick();
        let subscription = SubscriptionRecord {
            id: Uuid::new_v4(),
            company_id: new.company_id,
            plan_id: new.plan_id,
            status: SubscriptionStatus::Trial,
            billing_interval: BillingInterval::Monthly,
            current_period_end: Some(new.period_end),
            trial_ends_at: None,
            external_subscription_id: None,
            cancel_at_period_end: false,
            pending_invoice_id: None,
            created_at: now,
            updated_at: now,
        };
        let invoice = Invoice {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            company_id: new.company_id,
            invoice_number,
            payment_period_months: i32::from(new.payment_period),
            amount: new.amount,
            currency: new.currency,
            status: InvoiceStatus::Pending,
            external_id: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };

        state.subscriptions.push(subscription.clone());
        state.invoices.push(invoice.clone());

        Ok(PendingInvoice {
            subscription: SubscriptionRecord {
                pending_invoice_id: Some(invoice.id),
                ..subscription
            },
            invoice,
        })
    }

    async fn attach_external_payment(
        &self,
        invoice_id: Uuid,
        payment_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.lock();
        let stamp = state.tick();
        let invoice = state
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice_id)
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))?;
        invoice.external_id = Some(payment_id.to_string());
        invoice.updated_at = stamp;
        let subscription_id = invoice.subscription_id;

        if let Some(record) = state.subscription_mut(subscription_id) {
            record.external_subscription_id = Some(payment_id.to_string());
            record.updated_at = stamp;
        }
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.lock().invoices.iter().find(|i| i.id == invoice_id).cloned())
    }

    async fn find_invoice_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .lock()
            .invoices
            .iter()
            .find(|i| i.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn pending_invoices_with_amount(&self, amount: i64) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .lock()
            .invoices
            .iter()
            .filter(|i| i.is_pending() && i.amount == amount)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .lock()
            .invoices
            .iter()
            .filter(|i| i.company_id == company_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn settle_invoice(
        &self,
        invoice_id: Uuid,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>> {
        let mut state = self.lock();
        let Some(months) = state
            .invoices
            .iter()
            .find(|i| i.id == invoice_id && i.is_pending())
            .map(Invoice::months)
        else {
            return Ok(None);
        };
        let period_end = add_months(paid_at, months)?;
        let stamp = state.tick();

        let Some(invoice) = state.invoices.iter_mut().find(|i| i.id == invoice_id) else {
            return Ok(None);
        };
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(paid_at);
        invoice.updated_at = stamp;
        let invoice = invoice.clone();

        let record = state
            .subscription_mut(invoice.subscription_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Subscription {} of invoice {} not found",
                    invoice.subscription_id, invoice.invoice_number
                ))
            })?;
        record.status = SubscriptionStatus::Active;
        record.current_period_end = Some(period_end);
        record.updated_at = stamp;

        let subscription = state
            .read_subscription(invoice.subscription_id)
            .ok_or_else(|| BillingError::Internal("Settled subscription vanished".into()))?;

        Ok(Some(Settlement {
            invoice,
            subscription,
        }))
    }

    async fn fail_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let mut state = self.lock();
        let stamp = state.tick();
        Ok(state
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice_id && i.is_pending())
            .map(|invoice| {
                invoice.status = InvoiceStatus::Failed;
                invoice.updated_at = stamp;
                invoice.clone()
            }))
    }

    async fn fail_stale_invoices(&self, created_before: OffsetDateTime) -> BillingResult<StaleSweep> {
        let mut state = self.lock();
        let stamp = state.tick();
        let mut sweep = StaleSweep::default();
        for invoice in state
            .invoices
            .iter_mut()
            .filter(|i| i.is_pending() && i.created_at < created_before)
        {
            invoice.status = InvoiceStatus::Failed;
            invoice.updated_at = stamp;
            sweep.invoices.push(invoice.clone());
        }

        let to_cancel: Vec<Uuid> = state
            .subscriptions
            .iter()
            .filter(|s| sweep.invoices.iter().any(|i| i.subscription_id == s.id))
            .filter(|s| s.status == SubscriptionStatus::Trial && s.trial_ends_at.is_none())
            .filter(|s| state.pending_invoice_id(s.id).is_none())
            .map(|s| s.id)
            .collect();
        for id in &to_cancel {
            if let Some(record) = state.subscription_mut(*id) {
                record.status = SubscriptionStatus::Canceled;
                record.updated_at = stamp;
            }
        }
        sweep.abandoned_subscriptions = to_cancel;
        Ok(sweep)
    }

    async fn record_event(&self, event: NewBillingEvent) -> BillingResult<Uuid> {
        let mut state = self.lock();
        let id = Uuid::new_v4();
        let created_at = state.tick();
        state.events.push(BillingEvent {
            id,
            company_id: event.company_id,
            event_type: event.event_type.to_string(),
            event_data: event.event_data,
            actor_id: event.actor_id,
            actor_type: event.actor_type.to_string(),
            created_at,
        });
        Ok(id)
    }

    async fn list_events(&self, company_id: Uuid, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        let state = self.lock();
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.company_id == company_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
