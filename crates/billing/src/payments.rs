//! Payment reconcilers
//!
//! Four paths observe an external payment signal and settle invoices:
//!
//! - manual confirmation by the company owner
//! - the instant-payment provider webhook, matched by provider payment id
//! - the bank-statement webhook, matched by amount and payment purpose
//! - polling the provider for rows still waiting for a confirmation
//!
//! Replays are safe because every transition is guarded on the invoice still being
//! PENDING inside the store.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{PaymentProvider, PaymentStatus};
use crate::error::{BillingError, BillingResult};
use crate::events::{log_event, ActorType, BillingEventBuilder, BillingEventType};
use crate::store::{BillingStore, Invoice, Settlement, SubscriptionRecord};
use crate::subscriptions::SubscriptionState;

/// Credits at or above this are also tried as minor units
const MINOR_UNIT_THRESHOLD: f64 = 100.0;

/// One credited operation of a bank statement
#[derive(Debug, Clone, PartialEq)]
pub struct BankOperation {
    pub operation_id: Option<String>,
    pub credit: f64,
    pub purpose: String,
}

/// Amounts to look for, in order: the credit itself, then the credit read as minor units
pub fn candidate_amounts(credit: f64) -> Vec<i64> {
    if !credit.is_finite() || credit <= 0.0 {
        return Vec::new();
    }
    let mut amounts = vec![credit.round() as i64];
    if credit >= MINOR_UNIT_THRESHOLD {
        let major = (credit / 100.0).round() as i64;
        if major > 0 && !amounts.contains(&major) {
            amounts.push(major);
        }
    }
    amounts
}

/// Pick the invoice a transfer pays for out of same-amount candidates: the one whose
/// number appears in the purpose, else the newest.
pub fn match_invoice<'a>(candidates: &'a [Invoice], purpose: &str) -> Option<&'a Invoice> {
    candidates
        .iter()
        .find(|i| purpose.contains(&i.invoice_number))
        .or_else(|| candidates.iter().max_by_key(|i| i.created_at))
}

/// Result of processing one bank-statement delivery
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankSettlementReport {
    pub operations: usize,
    pub settled_invoice: Option<String>,
}

/// Result of polling the provider for one company
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub activated: bool,
}

/// Result of polling every company that waits for a provider confirmation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub companies: usize,
    pub activated: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl PaymentReconciler {
    pub fn new(store: Arc<dyn BillingStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    async fn record_settlement(&self, settlement: &Settlement, actor: ActorType, actor_id: Option<Uuid>) {
        let invoice = &settlement.invoice;
        tracing::info!(
            company_id = %invoice.company_id,
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            subscription_id = %settlement.subscription.id,
            actor = %actor,
            "Invoice paid, subscription activated"
        );

        let mut event = BillingEventBuilder::new(invoice.company_id, BillingEventType::InvoicePaid)
            .data(serde_json::json!({
                "invoice_id": invoice.id,
                "invoice_number": invoice.invoice_number,
                "amount": invoice.amount,
                "subscription_id": settlement.subscription.id,
                "current_period_end": settlement.subscription.current_period_end.map(|t| t.unix_timestamp()),
            }))
            .actor_type(actor);
        if let Some(id) = actor_id {
            event = event.actor(id, actor);
        }
        log_event(self.store.as_ref(), event).await;
    }

    /// Settle an invoice that is still PENDING, or report it as already processed
    async fn settle(
        &self,
        invoice: &Invoice,
        now: OffsetDateTime,
        actor: ActorType,
        actor_id: Option<Uuid>,
    ) -> BillingResult<Settlement> {
        if !invoice.is_pending() {
            return Err(BillingError::AlreadyProcessed(invoice.invoice_number.clone()));
        }
        let settlement = self
            .store
            .settle_invoice(invoice.id, now)
            .await?
            .ok_or_else(|| BillingError::AlreadyProcessed(invoice.invoice_number.clone()))?;
        self.record_settlement(&settlement, actor, actor_id).await;
        Ok(settlement)
    }

    /// Owner confirms that an invoice was paid outside any automated rail.
    /// `company_id` scopes the lookup; another company's invoice is reported as not found.
    pub async fn confirm_invoice_payment(
        &self,
        company_id: Option<Uuid>,
        invoice_id: Uuid,
        now: OffsetDateTime,
        actor_id: Option<Uuid>,
    ) -> BillingResult<Settlement> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .filter(|i| company_id.map_or(true, |c| c == i.company_id))
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))?;

        self.settle(&invoice, now, ActorType::User, actor_id).await
    }

    /// Provider reported `payment.succeeded`
    pub async fn settle_by_external_id(
        &self,
        payment_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let invoice = self
            .store
            .find_invoice_by_external_id(payment_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("No invoice for payment {}", payment_id))
            })?;
        self.settle(&invoice, now, ActorType::Provider, None).await
    }

    /// Provider reported `payment.canceled`. The subscription row is left untouched.
    pub async fn fail_by_external_id(&self, payment_id: &str) -> BillingResult<Invoice> {
        let invoice = self
            .store
            .find_invoice_by_external_id(payment_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("No invoice for payment {}", payment_id))
            })?;

        let failed = self
            .store
            .fail_invoice(invoice.id)
            .await?
            .ok_or_else(|| BillingError::AlreadyProcessed(invoice.invoice_number.clone()))?;

        tracing::info!(
            company_id = %failed.company_id,
            invoice_id = %failed.id,
            payment_id = %payment_id,
            "Invoice failed after payment cancellation"
        );
        log_event(
            self.store.as_ref(),
            BillingEventBuilder::new(failed.company_id, BillingEventType::InvoiceFailed)
                .data(serde_json::json!({
                    "invoice_id": failed.id,
                    "payment_id": payment_id,
                    "reason": "payment_canceled",
                }))
                .actor_type(ActorType::Provider),
        )
        .await;
        Ok(failed)
    }

    /// Match a bank statement against PENDING invoices. At most one invoice is settled
    /// per delivery: processing stops at the first successful settlement.
    pub async fn settle_bank_operations(
        &self,
        operations: &[BankOperation],
        now: OffsetDateTime,
    ) -> BillingResult<BankSettlementReport> {
        let mut report = BankSettlementReport {
            operations: operations.len(),
            settled_invoice: None,
        };

        for operation in operations {
            let amounts = candidate_amounts(operation.credit);
            if amounts.is_empty() {
                tracing::debug!(operation_id = ?operation.operation_id, "Skipping non-credit operation");
                continue;
            }

            for amount in amounts {
                let candidates = self.store.pending_invoices_with_amount(amount).await?;
                let Some(invoice) = match_invoice(&candidates, &operation.purpose) else {
                    continue;
                };

                match self.settle(invoice, now, ActorType::Bank, None).await {
                    Ok(settlement) => {
                        report.settled_invoice = Some(settlement.invoice.invoice_number);
                        return Ok(report);
                    }
                    Err(e) if e.is_business_mismatch() => {
                        tracing::warn!(
                            operation_id = ?operation.operation_id,
                            invoice_number = %invoice.invoice_number,
                            error = %e,
                            "Matched invoice could not be settled"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            tracing::warn!(
                operation_id = ?operation.operation_id,
                credit = operation.credit,
                "Bank operation matched no pending invoice"
            );
        }

        Ok(report)
    }

    /// The newest row that is ACTIVE with a paid period still running, other than `exclude`
    fn running_paid_subscription<'a>(
        records: &'a [SubscriptionRecord],
        exclude: Uuid,
        now: OffsetDateTime,
    ) -> Option<&'a SubscriptionRecord> {
        records
            .iter()
            .filter(|r| r.id != exclude)
            .filter(|r| {
                matches!(r.state(), SubscriptionState::Active { period_end: Some(end) } if end > now)
            })
            .max_by_key(|r| r.created_at)
    }

    /// Ask the provider about every row of this company still waiting for a payment
    /// confirmation. Provider failures are logged and leave the row waiting.
    pub async fn sync_pending_payments(
        &self,
        company_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        for row in self.store.awaiting_provider(company_id).await? {
            let Some(payment_id) = row.external_subscription_id.clone() else {
                continue;
            };

            let payment = match self.provider.get_payment(&payment_id).await {
                Ok(payment) => payment,
                Err(e @ BillingError::ProviderTimeout(_)) | Err(e @ BillingError::Provider(_)) => {
                    tracing::warn!(
                        company_id = %company_id,
                        payment_id = %payment_id,
                        error = %e,
                        "Payment status unavailable, will retry on next sync"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match payment.status {
                PaymentStatus::Succeeded => {
                    if self.activate_paid_row(&row, &payment_id, now).await? {
                        outcome.activated = true;
                    }
                }
                PaymentStatus::Canceled => self.abandon_row(&row, &payment_id).await?,
                PaymentStatus::Pending | PaymentStatus::WaitingForCapture | PaymentStatus::Unknown => {
                    tracing::debug!(
                        company_id = %company_id,
                        payment_id = %payment_id,
                        status = ?payment.status,
                        "Payment not completed yet"
                    );
                }
            }
        }

        Ok(outcome)
    }

    async fn activate_paid_row(
        &self,
        row: &SubscriptionRecord,
        payment_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let invoice = self.store.find_invoice_by_external_id(payment_id).await?;
        if let Some(closed) = invoice.as_ref().filter(|i| !i.is_pending()) {
            self.reject_late_payment(row, closed, payment_id).await?;
            return Ok(false);
        }

        let months = match invoice {
            Some(invoice) => invoice.months(),
            None => {
                tracing::error!(
                    company_id = %row.company_id,
                    subscription_id = %row.id,
                    payment_id = %payment_id,
                    "Paid subscription has no invoice for its payment, granting one month"
                );
                log_event(
                    self.store.as_ref(),
                    BillingEventBuilder::new(row.company_id, BillingEventType::PaymentAnomaly)
                        .data(serde_json::json!({
                            "subscription_id": row.id,
                            "payment_id": payment_id,
                            "reason": "invoice_missing",
                        }))
                        .actor_type(ActorType::Provider),
                )
                .await;
                1
            }
        };

        let records = self.store.list_subscriptions(row.company_id).await?;

        if let Some(active) = Self::running_paid_subscription(&records, row.id, now) {
            let previous_end = active.current_period_end;
            let Some(renewed) = self
                .store
                .merge_renewal(row.id, active.id, months, now)
                .await?
            else {
                if !self.closed_meanwhile(row, payment_id).await? {
                    tracing::warn!(
                        company_id = %row.company_id,
                        subscription_id = %row.id,
                        "Renewal target changed during sync, skipping"
                    );
                }
                return Ok(false);
            };

            tracing::info!(
                company_id = %row.company_id,
                subscription_id = %renewed.id,
                merged_subscription_id = %row.id,
                months = months,
                "Subscription renewed from polled payment"
            );
            log_event(
                self.store.as_ref(),
                BillingEventBuilder::new(row.company_id, BillingEventType::SubscriptionRenewed)
                    .data(serde_json::json!({
                        "subscription_id": renewed.id,
                        "merged_subscription_id": row.id,
                        "payment_id": payment_id,
                        "previous_period_end": previous_end.map(|t| t.unix_timestamp()),
                        "current_period_end": renewed.current_period_end.map(|t| t.unix_timestamp()),
                    }))
                    .actor_type(ActorType::Provider),
            )
            .await;
            return Ok(true);
        }

        let Some(activated) = self.store.activate_awaiting(row.id, months, now).await? else {
            self.closed_meanwhile(row, payment_id).await?;
            return Ok(false);
        };

        tracing::info!(
            company_id = %row.company_id,
            subscription_id = %activated.id,
            months = months,
            "Subscription activated from polled payment"
        );
        log_event(
            self.store.as_ref(),
            BillingEventBuilder::new(row.company_id, BillingEventType::SubscriptionActivated)
                .data(serde_json::json!({
                    "subscription_id": activated.id,
                    "payment_id": payment_id,
                    "current_period_end": activated.current_period_end.map(|t| t.unix_timestamp()),
                }))
                .actor_type(ActorType::Provider),
        )
        .await;
        Ok(true)
    }

    /// After the store refused an activation: if the invoice was closed in between,
    /// handle it as a late payment. Returns true when it was.
    async fn closed_meanwhile(&self, row: &SubscriptionRecord, payment_id: &str) -> BillingResult<bool> {
        match self.store.find_invoice_by_external_id(payment_id).await? {
            Some(invoice) if !invoice.is_pending() => {
                self.reject_late_payment(row, &invoice, payment_id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The provider took a payment for an invoice that is no longer PENDING (expired or
    /// failed first). No access is granted; the row stops waiting and the anomaly is
    /// recorded for manual follow-up.
    async fn reject_late_payment(
        &self,
        row: &SubscriptionRecord,
        invoice: &Invoice,
        payment_id: &str,
    ) -> BillingResult<()> {
        tracing::error!(
            company_id = %row.company_id,
            subscription_id = %row.id,
            invoice_number = %invoice.invoice_number,
            invoice_status = ?invoice.status,
            payment_id = %payment_id,
            "Provider payment succeeded for a closed invoice, not activating"
        );
        log_event(
            self.store.as_ref(),
            BillingEventBuilder::new(row.company_id, BillingEventType::PaymentAnomaly)
                .data(serde_json::json!({
                    "subscription_id": row.id,
                    "invoice_id": invoice.id,
                    "invoice_number": invoice.invoice_number,
                    "invoice_status": invoice.status,
                    "payment_id": payment_id,
                    "reason": "invoice_not_pending",
                }))
                .actor_type(ActorType::Provider),
        )
        .await;
        self.store.abandon_awaiting(row.id).await?;
        Ok(())
    }

    async fn abandon_row(&self, row: &SubscriptionRecord, payment_id: &str) -> BillingResult<()> {
        if let Some(invoice) = self.store.find_invoice_by_external_id(payment_id).await? {
            self.store.fail_invoice(invoice.id).await?;
        }
        if self.store.abandon_awaiting(row.id).await? {
            tracing::info!(
                company_id = %row.company_id,
                subscription_id = %row.id,
                payment_id = %payment_id,
                "Payment canceled at provider, pending subscription abandoned"
            );
            log_event(
                self.store.as_ref(),
                BillingEventBuilder::new(row.company_id, BillingEventType::SubscriptionAbandoned)
                    .data(serde_json::json!({
                        "subscription_id": row.id,
                        "payment_id": payment_id,
                    }))
                    .actor_type(ActorType::Provider),
            )
            .await;
        }
        Ok(())
    }

    /// Poll every company that has rows waiting for a provider confirmation.
    /// Companies are reconciled independently.
    pub async fn sync_all_pending_payments(&self, now: OffsetDateTime) -> BillingResult<SyncReport> {
        let companies = self.store.companies_awaiting_provider().await?;
        let mut report = SyncReport {
            companies: companies.len(),
            ..SyncReport::default()
        };

        for company_id in companies {
            match self.sync_pending_payments(company_id, now).await {
                Ok(outcome) if outcome.activated => report.activated += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        company_id = %company_id,
                        error = %e,
                        "Payment sync failed for company"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealflow_shared::InvoiceStatus;
    use time::macros::datetime;

    fn invoice(number: &str, amount: i64, created_at: OffsetDateTime) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            invoice_number: number.to_string(),
            payment_period_months: 1,
            amount,
            currency: "RUB".to_string(),
            status: InvoiceStatus::Pending,
            external_id: None,
            paid_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_candidate_amounts() {
        assert_eq!(candidate_amounts(1500.0), vec![1500, 15]);
        assert_eq!(candidate_amounts(150000.0), vec![150000, 1500]);
        assert_eq!(candidate_amounts(99.6), vec![100]);
        assert!(candidate_amounts(0.0).is_empty());
        assert!(candidate_amounts(-20.0).is_empty());
        assert!(candidate_amounts(f64::NAN).is_empty());
    }

    #[test]
    fn test_match_prefers_number_in_purpose() {
        let older = invoice("INV-20240501-0001", 1500, datetime!(2024-05-01 09:00 UTC));
        let newer = invoice("INV-20240501-0002", 1500, datetime!(2024-05-01 10:00 UTC));
        let candidates = vec![newer.clone(), older.clone()];

        let picked = match_invoice(&candidates, "Payment for INV-20240501-0001, VAT free").unwrap();
        assert_eq!(picked.id, older.id);

        let picked = match_invoice(&candidates, "Subscription payment").unwrap();
        assert_eq!(picked.id, newer.id);

        assert!(match_invoice(&[], "INV-20240501-0001").is_none());
    }
}
