//! Invoice generator
//!
//! Legal entities are billed by invoice and pay by bank transfer. Individuals pay the
//! same invoice instantly through the payment provider. Both paths open a PENDING
//! invoice linked to a pending-activation subscription row; only a reconciler ever
//! moves that invoice to PAID.

use std::sync::Arc;

use dealflow_shared::{LegalForm, PaymentPeriod};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::{BillingConfig, CreatePayment, PaymentProvider};
use crate::error::{BillingError, BillingResult};
use crate::events::{log_event, ActorType, BillingEventBuilder, BillingEventType};
use crate::period::add_months;
use crate::store::{BillingStore, Invoice, NewInvoice, PendingInvoice};

/// Invoice handed back to a legal entity
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedInvoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub amount: i64,
    pub currency: String,
    pub pdf_url: String,
}

/// Instant payment started for an individual
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantPayment {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub amount: i64,
    pub currency: String,
    pub payment_id: String,
    pub confirmation_url: Option<String>,
}

#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    provider: Arc<dyn PaymentProvider>,
    config: BillingConfig,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        provider: Arc<dyn PaymentProvider>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            provider,
            config,
        }
    }

    /// Validate the request and open the invoice plus its pending row
    async fn open_invoice(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        payment_period_months: i32,
        expected_form: LegalForm,
        now: OffsetDateTime,
        actor_id: Option<Uuid>,
    ) -> BillingResult<PendingInvoice> {
        let period = PaymentPeriod::try_from(payment_period_months)?;

        let company = self
            .store
            .get_company(company_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Company {} not found", company_id)))?;
        if company.legal_form != expected_form {
            return Err(BillingError::Validation(match expected_form {
                LegalForm::LegalEntity => {
                    "Invoices are issued to legal entities only; individuals pay instantly"
                        .to_string()
                }
                LegalForm::Individual => {
                    "Legal entities pay by invoice and bank transfer".to_string()
                }
            }));
        }

        let plan = self.catalog.get_plan(plan_id).await?;
        if plan.is_free() {
            return Err(BillingError::Validation(format!(
                "Plan {} is free; activate it directly instead",
                plan.slug
            )));
        }

        let amount = plan
            .price_per_month
            .checked_mul(i64::from(period.months()))
            .ok_or_else(|| BillingError::Validation("Invoice amount overflows".to_string()))?;

        let pending = self
            .store
            .create_pending_invoice(NewInvoice {
                company_id,
                plan_id,
                payment_period: period,
                amount,
                currency: plan.currency.clone(),
                period_end: add_months(now, period.months())?,
                issued_at: now,
            })
            .await?;

        tracing::info!(
            company_id = %company_id,
            invoice_id = %pending.invoice.id,
            invoice_number = %pending.invoice.invoice_number,
            amount = amount,
            months = period.months(),
            "Invoice created"
        );

        let mut event = BillingEventBuilder::new(company_id, BillingEventType::InvoiceCreated)
            .data(serde_json::json!({
                "invoice_id": pending.invoice.id,
                "invoice_number": pending.invoice.invoice_number,
                "plan": plan.slug,
                "amount": amount,
                "payment_period_months": period.months(),
            }))
            .actor_type(ActorType::User);
        if let Some(actor) = actor_id {
            event = event.actor(actor, ActorType::User);
        }
        log_event(self.store.as_ref(), event).await;

        Ok(pending)
    }

    fn pdf_url(&self, invoice: &Invoice) -> String {
        self.config.invoice_pdf_url(&invoice.invoice_number)
    }

    /// Bill a legal entity for `plan_id` over `payment_period_months`
    pub async fn generate_invoice(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        payment_period_months: i32,
        now: OffsetDateTime,
        actor_id: Option<Uuid>,
    ) -> BillingResult<GeneratedInvoice> {
        let pending = self
            .open_invoice(
                company_id,
                plan_id,
                payment_period_months,
                LegalForm::LegalEntity,
                now,
                actor_id,
            )
            .await?;

        let invoice = pending.invoice;
        Ok(GeneratedInvoice {
            pdf_url: self.pdf_url(&invoice),
            invoice_id: invoice.id,
            invoice_number: invoice.invoice_number,
            amount: invoice.amount,
            currency: invoice.currency,
        })
    }

    /// Open an invoice for an individual and create the matching provider payment
    pub async fn start_instant_payment(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
        payment_period_months: i32,
        return_url: &str,
        now: OffsetDateTime,
        actor_id: Option<Uuid>,
    ) -> BillingResult<InstantPayment> {
        let PendingInvoice { invoice, .. } = self
            .open_invoice(
                company_id,
                plan_id,
                payment_period_months,
                LegalForm::Individual,
                now,
                actor_id,
            )
            .await?;

        let request = CreatePayment {
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            description: format!("Subscription payment, invoice {}", invoice.invoice_number),
            return_url: return_url.to_string(),
            invoice_id: invoice.id,
        };

        let payment = match self.provider.create_payment(request).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(
                    company_id = %company_id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "Payment provider rejected payment creation"
                );
                if self.store.fail_invoice(invoice.id).await?.is_some() {
                    log_event(
                        self.store.as_ref(),
                        BillingEventBuilder::new(company_id, BillingEventType::InvoiceFailed)
                            .data(serde_json::json!({
                                "invoice_id": invoice.id,
                                "reason": "payment_creation_failed",
                            }))
                            .actor_type(ActorType::Provider),
                    )
                    .await;
                }
                return Err(e);
            }
        };

        self.store
            .attach_external_payment(invoice.id, &payment.id)
            .await?;

        tracing::info!(
            company_id = %company_id,
            invoice_id = %invoice.id,
            payment_id = %payment.id,
            "Instant payment created"
        );

        Ok(InstantPayment {
            invoice_id: invoice.id,
            invoice_number: invoice.invoice_number,
            amount: invoice.amount,
            currency: invoice.currency,
            payment_id: payment.id,
            confirmation_url: payment.confirmation_url,
        })
    }

    /// Invoices of a company, newest first
    pub async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>> {
        self.store.list_invoices(company_id).await
    }

    /// Fail every PENDING invoice older than the configured TTL. Rows that were only
    /// waiting for one of those invoices are canceled, so they are not polled forever;
    /// they never granted access. Returns the number of invoices failed.
    pub async fn expire_stale_invoices(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let cutoff = now - Duration::days(self.config.invoice_ttl_days);
        let sweep = self.store.fail_stale_invoices(cutoff).await?;

        for invoice in &sweep.invoices {
            log_event(
                self.store.as_ref(),
                BillingEventBuilder::new(invoice.company_id, BillingEventType::InvoiceExpired)
                    .data(serde_json::json!({
                        "invoice_id": invoice.id,
                        "invoice_number": invoice.invoice_number,
                        "ttl_days": self.config.invoice_ttl_days,
                    })),
            )
            .await;
        }

        for subscription_id in &sweep.abandoned_subscriptions {
            let Some(invoice) = sweep
                .invoices
                .iter()
                .find(|i| i.subscription_id == *subscription_id)
            else {
                continue;
            };
            log_event(
                self.store.as_ref(),
                BillingEventBuilder::new(invoice.company_id, BillingEventType::SubscriptionAbandoned)
                    .data(serde_json::json!({
                        "subscription_id": subscription_id,
                        "invoice_number": invoice.invoice_number,
                        "reason": "invoice_expired",
                    })),
            )
            .await;
        }

        if !sweep.invoices.is_empty() {
            tracing::info!(
                expired = sweep.invoices.len(),
                abandoned = sweep.abandoned_subscriptions.len(),
                ttl_days = self.config.invoice_ttl_days,
                "Expired stale pending invoices"
            );
        }
        Ok(sweep.invoices.len() as u64)
    }
}
