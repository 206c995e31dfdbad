//! End-to-end lifecycle tests against the in-memory store

use std::collections::HashMap;
use std::sync::Arc;

use dealflow_shared::{InvoiceStatus, LegalForm, PlanSlug, SubscriptionStatus};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::{BillingConfig, MockFailure, MockPaymentProvider, PaymentStatus};
use crate::error::BillingError;
use crate::expiry::EXPIRY_NOTICE_TITLE;
use crate::notify::MemoryNotificationSink;
use crate::numbering::parse_sequence;
use crate::period::add_months;
use crate::store::memory::MemoryBillingStore;
use crate::store::{BillingStore, NewSubscription, Plan};
use crate::subscriptions::{resolve_effective, SubscriptionState};
use crate::webhooks::PaymentWebhookOutcome;
use crate::BillingService;

const WEBHOOK_SECRET: &str = "whsec_lifecycle";
const BANK_TOKEN: &str = "bank-token";

struct Harness {
    store: MemoryBillingStore,
    provider: MockPaymentProvider,
    sink: MemoryNotificationSink,
    billing: BillingService,
    plans: HashMap<PlanSlug, Plan>,
}

impl Harness {
    async fn new() -> Self {
        let store = MemoryBillingStore::new();
        let provider = MockPaymentProvider::new();
        let sink = MemoryNotificationSink::new();
        let config = BillingConfig {
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            bank_webhook_token: Some(BANK_TOKEN.to_string()),
            public_url: "https://crm.example".to_string(),
            ..BillingConfig::default()
        };
        let billing = BillingService::new(
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
            Arc::new(sink.clone()),
            config,
        );
        billing.catalog.ensure_default_plans().await.unwrap();
        let plans = billing
            .catalog
            .list_plans()
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.slug, p))
            .collect();

        Self {
            store,
            provider,
            sink,
            billing,
            plans,
        }
    }

    fn plan(&self, slug: PlanSlug) -> Uuid {
        self.plans[&slug].id
    }

    async fn active_until(&self, company_id: Uuid, slug: PlanSlug, end: OffsetDateTime) -> Uuid {
        self.store
            .insert_subscription(NewSubscription {
                company_id,
                plan_id: self.plan(slug),
                status: SubscriptionStatus::Active,
                current_period_end: Some(end),
                trial_ends_at: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn payment_webhook(
        &self,
        event: &str,
        payment_id: &str,
        now: OffsetDateTime,
    ) -> Result<PaymentWebhookOutcome, BillingError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "type": "notification",
            "event": event,
            "object": {"id": payment_id, "status": "succeeded"},
        }))
        .unwrap();
        let signature = sign(&payload);
        self.billing
            .webhooks
            .handle_payment_notification(&payload, &[signature.as_str()], now)
            .await
    }

    async fn effective(&self, company_id: Uuid, now: OffsetDateTime) -> Option<Uuid> {
        self.billing
            .subscriptions
            .resolve_current_subscription(company_id, now)
            .await
            .unwrap()
            .map(|e| e.subscription.id)
    }
}

fn sign(payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

const NOW: OffsetDateTime = datetime!(2024-05-10 09:30 UTC);

// =============================================================================
// Resolver
// =============================================================================

#[tokio::test]
async fn test_resolver_returns_at_most_one_row_matching_priority() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);

    // Expired paid row, live trial, and an unpaid invoice row
    h.active_until(company, PlanSlug::Team, NOW - Duration::days(1)).await;
    let trial = h
        .billing
        .subscriptions
        .start_trial(company, h.plan(PlanSlug::Pro), NOW, None)
        .await
        .unwrap();
    h.billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Team), 3, NOW, None)
        .await
        .unwrap();

    for at in [NOW, NOW + Duration::days(7), NOW + Duration::days(20)] {
        let rows = h.store.list_subscriptions(company).await.unwrap();
        let expected = resolve_effective(&rows, at).map(|r| r.id);
        assert_eq!(h.effective(company, at).await, expected);
    }
    assert_eq!(h.effective(company, NOW).await, Some(trial.id));
    assert_eq!(h.effective(company, NOW + Duration::days(15)).await, None);
}

#[tokio::test]
async fn test_trial_with_pending_invoice_is_never_effective() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);

    h.billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Pro), 1, NOW, None)
        .await
        .unwrap();
    let pending_row = h.store.subscriptions()[0].clone();
    h.store
        .set_trial_end(pending_row.id, Some(NOW + Duration::days(3650)));

    let row = h.store.list_subscriptions(company).await.unwrap().remove(0);
    assert!(matches!(row.state(), SubscriptionState::AwaitingPayment { invoice_id: Some(_) }));
    assert_eq!(h.effective(company, NOW).await, None);

    // Nor may it be treated as a trial for plan switches
    let err = h
        .billing
        .subscriptions
        .update_trial_plan(company, h.plan(PlanSlug::Team), NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NoActiveTrial(_)));
}

// =============================================================================
// Plan changes
// =============================================================================

#[tokio::test]
async fn test_free_plan_activation() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);

    let err = h
        .billing
        .subscriptions
        .activate_free_plan(company, h.plan(PlanSlug::Team), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentRequired(_)));
    assert!(h.store.subscriptions().is_empty());

    let record = h
        .billing
        .subscriptions
        .activate_free_plan(company, h.plan(PlanSlug::Lite), None)
        .await
        .unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert!(record.current_period_end.is_none());
    assert_eq!(
        h.effective(company, NOW + Duration::days(10_000)).await,
        Some(record.id)
    );
}

#[tokio::test]
async fn test_trial_plan_switch_keeps_trial_end() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);

    let err = h
        .billing
        .subscriptions
        .update_trial_plan(company, h.plan(PlanSlug::Pro), NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NoActiveTrial(_)));

    let trial = h
        .billing
        .subscriptions
        .start_trial(company, h.plan(PlanSlug::Team), NOW, None)
        .await
        .unwrap();
    assert_eq!(trial.trial_ends_at, Some(NOW + Duration::days(14)));

    let switched = h
        .billing
        .subscriptions
        .update_trial_plan(company, h.plan(PlanSlug::Pro), NOW + Duration::days(3), None)
        .await
        .unwrap();
    assert_eq!(switched.id, trial.id);
    assert_eq!(switched.plan_id, h.plan(PlanSlug::Pro));
    assert_eq!(switched.trial_ends_at, trial.trial_ends_at);

    // Expired trial can no longer be switched
    let err = h
        .billing
        .subscriptions
        .update_trial_plan(company, h.plan(PlanSlug::Team), NOW + Duration::days(14), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NoActiveTrial(_)));

    // And a second trial is refused
    let err = h
        .billing
        .subscriptions
        .start_trial(company, h.plan(PlanSlug::Team), NOW + Duration::days(30), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

// =============================================================================
// Invoicing
// =============================================================================

#[tokio::test]
async fn test_invoice_numbers_increase_within_a_day() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);

    let mut numbers = Vec::new();
    for i in 0..5 {
        let invoice = h
            .billing
            .invoices
            .generate_invoice(company, h.plan(PlanSlug::Team), 1, NOW + Duration::minutes(i), None)
            .await
            .unwrap();
        assert_eq!(invoice.amount, 1500);
        assert_eq!(invoice.currency, "RUB");
        assert_eq!(
            invoice.pdf_url,
            format!("https://crm.example/invoices/{}.pdf", invoice.invoice_number)
        );
        numbers.push(invoice.invoice_number);
    }

    assert!(numbers.iter().all(|n| n.starts_with("INV-20240510-")));
    let sequences: Vec<u32> = numbers.iter().filter_map(|n| parse_sequence(n)).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    // A new day restarts the sequence
    let next_day = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Team), 1, NOW + Duration::days(1), None)
        .await
        .unwrap();
    assert_eq!(next_day.invoice_number, "INV-20240511-0001");
}

#[tokio::test]
async fn test_daily_sequence_exhaustion_is_an_error() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    h.store.set_daily_counter(NOW.date(), 9_999);

    let err = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Team), 1, NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Internal(_)));
    assert!(h.store.invoices().is_empty());
}

#[tokio::test]
async fn test_generate_invoice_validation() {
    let h = Harness::new().await;
    let individual = h.store.add_company("Solo", LegalForm::Individual);
    let entity = h.store.add_company("Acme LLC", LegalForm::LegalEntity);

    let err = h
        .billing
        .invoices
        .generate_invoice(individual, h.plan(PlanSlug::Team), 1, NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let err = h
        .billing
        .invoices
        .generate_invoice(entity, h.plan(PlanSlug::Team), 2, NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let err = h
        .billing
        .invoices
        .generate_invoice(entity, Uuid::new_v4(), 1, NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let invoice = h
        .billing
        .invoices
        .generate_invoice(entity, h.plan(PlanSlug::Pro), 12, NOW, None)
        .await
        .unwrap();
    assert_eq!(invoice.amount, 30_000);
    let row = &h.store.subscriptions()[0];
    assert_eq!(row.status, SubscriptionStatus::Trial);
    assert_eq!(row.current_period_end, Some(add_months(NOW, 12).unwrap()));
    assert!(row.trial_ends_at.is_none());
}

#[tokio::test]
async fn test_stale_invoices_expire_and_release_their_pending_rows() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    let now = OffsetDateTime::now_utc();

    let old = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Team), 1, now, None)
        .await
        .unwrap();
    let fresh = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Team), 1, now, None)
        .await
        .unwrap();
    h.store
        .backdate_invoice(old.invoice_id, now - Duration::days(31));
    let effective_before = h.effective(company, now).await;

    assert_eq!(h.billing.invoices.expire_stale_invoices(now).await.unwrap(), 1);
    assert_eq!(h.billing.invoices.expire_stale_invoices(now).await.unwrap(), 0);

    let invoices = h.store.invoices();
    let invoice = |id: Uuid| invoices.iter().find(|i| i.id == id).unwrap().clone();
    assert_eq!(invoice(old.invoice_id).status, InvoiceStatus::Failed);
    assert_eq!(invoice(fresh.invoice_id).status, InvoiceStatus::Pending);

    let rows = h.store.subscriptions();
    let row_status = |id: Uuid| rows.iter().find(|r| r.id == id).unwrap().status;
    assert_eq!(
        row_status(invoice(old.invoice_id).subscription_id),
        SubscriptionStatus::Canceled
    );
    assert_eq!(
        row_status(invoice(fresh.invoice_id).subscription_id),
        SubscriptionStatus::Trial
    );

    // Neither row ever granted access
    assert_eq!(effective_before, None);
    assert_eq!(h.effective(company, now).await, None);

    let events = h.store.events();
    assert!(events.iter().any(|e| e.event_type == "INVOICE_EXPIRED"));
    assert!(events.iter().any(|e| e.event_type == "SUBSCRIPTION_ABANDONED"));
}

#[tokio::test]
async fn test_expired_instant_invoice_is_never_activated_by_a_late_payment() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    let invoice_id = h.store.invoices()[0].id;
    h.store.backdate_invoice(invoice_id, NOW - Duration::days(31));

    assert_eq!(h.billing.invoices.expire_stale_invoices(NOW).await.unwrap(), 1);
    h.provider.set_status(&payment.payment_id, PaymentStatus::Succeeded);

    let outcome = h
        .payment_webhook("payment.succeeded", &payment.payment_id, NOW)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentWebhookOutcome::Ignored { .. }));

    let calls = h.provider.get_calls();
    let synced = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(!synced.activated);
    assert_eq!(h.provider.get_calls(), calls, "released rows are not polled");

    let invoice = &h.store.invoices()[0];
    assert_eq!(invoice.status, InvoiceStatus::Failed);
    assert!(invoice.paid_at.is_none());
    let row = &h.store.subscriptions()[0];
    assert_eq!(row.status, SubscriptionStatus::Canceled);
    assert_eq!(h.effective(company, NOW).await, None);
}

#[tokio::test]
async fn test_activation_refused_when_invoice_closed_before_poll() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Pro), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    let invoice_id = h.store.invoices()[0].id;
    let row_id = h.store.subscriptions()[0].id;

    // Closed without the sweep, so the row is still waiting for the provider
    h.store.fail_invoice(invoice_id).await.unwrap().unwrap();
    assert!(h
        .store
        .activate_awaiting(row_id, 1, NOW)
        .await
        .unwrap()
        .is_none());

    h.provider.set_status(&payment.payment_id, PaymentStatus::Succeeded);
    let synced = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(!synced.activated);

    let invoice = &h.store.invoices()[0];
    assert_eq!(invoice.status, InvoiceStatus::Failed);
    assert!(invoice.paid_at.is_none());
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Canceled);
    assert!(h
        .store
        .events()
        .iter()
        .any(|e| e.event_type == "PAYMENT_ANOMALY"));
}

#[tokio::test]
async fn test_renewal_refused_when_invoice_closed_before_poll() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let end = NOW + Duration::days(10);
    let active = h.active_until(company, PlanSlug::Team, end).await;
    h.billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    let invoice = h.store.invoices()[0].clone();
    h.store.fail_invoice(invoice.id).await.unwrap().unwrap();

    assert!(h
        .store
        .merge_renewal(invoice.subscription_id, active, 1, NOW)
        .await
        .unwrap()
        .is_none());
    let rows = h.store.subscriptions();
    let kept = rows.iter().find(|r| r.id == active).unwrap();
    assert_eq!(kept.current_period_end, Some(end));
    assert!(rows.iter().any(|r| r.id == invoice.subscription_id));
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_manual_confirmation_is_idempotent() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    let other = h.store.add_company("Other LLC", LegalForm::LegalEntity);

    let invoice = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Team), 3, NOW, None)
        .await
        .unwrap();

    let err = h
        .billing
        .payments
        .confirm_invoice_payment(Some(other), invoice.invoice_id, NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));

    let paid_at = NOW + Duration::hours(2);
    let settlement = h
        .billing
        .payments
        .confirm_invoice_payment(Some(company), invoice.invoice_id, paid_at, None)
        .await
        .unwrap();
    assert_eq!(settlement.invoice.status, InvoiceStatus::Paid);
    assert_eq!(settlement.invoice.paid_at, Some(paid_at));
    assert_eq!(settlement.subscription.status, SubscriptionStatus::Active);
    assert_eq!(
        settlement.subscription.current_period_end,
        Some(add_months(paid_at, 3).unwrap())
    );
    assert_eq!(h.effective(company, paid_at).await, Some(settlement.subscription.id));

    let err = h
        .billing
        .payments
        .confirm_invoice_payment(Some(company), invoice.invoice_id, paid_at + Duration::days(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyProcessed(_)));
    let row = h.store.subscriptions().remove(0);
    assert_eq!(row.current_period_end, Some(add_months(paid_at, 3).unwrap()));
}

#[tokio::test]
async fn test_replayed_success_webhook_settles_once() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);

    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example/billing", NOW, None)
        .await
        .unwrap();
    assert!(payment.confirmation_url.is_some());
    assert_eq!(h.provider.created().len(), 1);

    let first = h
        .payment_webhook("payment.succeeded", &payment.payment_id, NOW)
        .await
        .unwrap();
    assert_eq!(
        first,
        PaymentWebhookOutcome::Settled {
            invoice_number: payment.invoice_number.clone()
        }
    );

    let replay = h
        .payment_webhook("payment.succeeded", &payment.payment_id, NOW + Duration::days(5))
        .await
        .unwrap();
    assert!(matches!(replay, PaymentWebhookOutcome::Ignored { .. }));

    let row = h.store.subscriptions().remove(0);
    assert_eq!(row.status, SubscriptionStatus::Active);
    assert_eq!(row.current_period_end, Some(add_months(NOW, 1).unwrap()));
    let paid_events = h
        .store
        .events()
        .iter()
        .filter(|e| e.event_type == "INVOICE_PAID")
        .count();
    assert_eq!(paid_events, 1);
}

#[tokio::test]
async fn test_webhook_mismatches_are_acknowledged() {
    let h = Harness::new().await;

    let outcome = h
        .payment_webhook("payment.succeeded", "unknown-payment", NOW)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentWebhookOutcome::Ignored { .. }));

    let outcome = h
        .payment_webhook("refund.succeeded", "unknown-payment", NOW)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentWebhookOutcome::Ignored { .. }));
}

#[tokio::test]
async fn test_invalid_signature_changes_nothing() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Pro), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();

    let payload = serde_json::to_vec(&serde_json::json!({
        "type": "notification",
        "event": "payment.succeeded",
        "object": {"id": payment.payment_id},
    }))
    .unwrap();

    for signatures in [vec![], vec!["deadbeef"], vec!["sha256=00"]] {
        let err = h
            .billing
            .webhooks
            .handle_payment_notification(&payload, &signatures, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }
    assert_eq!(h.store.invoices()[0].status, InvoiceStatus::Pending);

    // A valid signature among several headers is enough
    let good = sign(&payload);
    let outcome = h
        .billing
        .webhooks
        .handle_payment_notification(&payload, &["bogus", good.as_str()], NOW)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentWebhookOutcome::Settled { .. }));
}

#[tokio::test]
async fn test_canceled_webhook_fails_invoice_only() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 6, "https://crm.example", NOW, None)
        .await
        .unwrap();

    let outcome = h
        .payment_webhook("payment.canceled", &payment.payment_id, NOW)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentWebhookOutcome::Failed { .. }));
    assert_eq!(h.store.invoices()[0].status, InvoiceStatus::Failed);
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Trial);
    assert_eq!(h.effective(company, NOW).await, None);
}

#[tokio::test]
async fn test_provider_failure_fails_the_new_invoice() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    h.provider.fail_next(MockFailure::Unavailable);

    let err = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Provider(_)));
    assert_eq!(h.store.invoices()[0].status, InvoiceStatus::Failed);

    // Legal entities cannot pay instantly
    let entity = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    let err = h
        .billing
        .invoices
        .start_instant_payment(entity, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn test_bank_statement_prefers_invoice_number_in_purpose() {
    let h = Harness::new().await;
    let first_company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    let second_company = h.store.add_company("Beta LLC", LegalForm::LegalEntity);

    let first = h
        .billing
        .invoices
        .generate_invoice(first_company, h.plan(PlanSlug::Team), 1, NOW, None)
        .await
        .unwrap();
    let second = h
        .billing
        .invoices
        .generate_invoice(second_company, h.plan(PlanSlug::Team), 1, NOW, None)
        .await
        .unwrap();

    let payload = serde_json::to_vec(&serde_json::json!({
        "operations": [{
            "operationId": "op-1",
            "credit": 1500,
            "payPurpose": format!("Payment under invoice {} for CRM", first.invoice_number),
        }]
    }))
    .unwrap();

    let report = h
        .billing
        .webhooks
        .handle_bank_statement(&payload, Some(BANK_TOKEN), NOW)
        .await
        .unwrap();
    assert_eq!(report.settled_invoice.as_deref(), Some(first.invoice_number.as_str()));

    let invoices = h.store.invoices();
    let status = |id: Uuid| invoices.iter().find(|i| i.id == id).unwrap().status;
    assert_eq!(status(first.invoice_id), InvoiceStatus::Paid);
    assert_eq!(status(second.invoice_id), InvoiceStatus::Pending);
}

#[tokio::test]
async fn test_bank_statement_minor_units_and_single_settlement() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    let older = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Pro), 1, NOW, None)
        .await
        .unwrap();
    let newer = h
        .billing
        .invoices
        .generate_invoice(company, h.plan(PlanSlug::Pro), 1, NOW, None)
        .await
        .unwrap();

    // 2500.00 in kopecks, twice in one delivery, no invoice reference
    let payload = serde_json::to_vec(&serde_json::json!({
        "operations": [
            {"operationId": "a", "amount": 250000, "description": "CRM subscription"},
            {"operationId": "b", "amount": 250000, "description": "CRM subscription"}
        ]
    }))
    .unwrap();
    let report = h
        .billing
        .webhooks
        .handle_bank_statement(&payload, Some(BANK_TOKEN), NOW)
        .await
        .unwrap();
    assert_eq!(report.operations, 2);
    assert_eq!(report.settled_invoice.as_deref(), Some(newer.invoice_number.as_str()));

    let invoices = h.store.invoices();
    let status = |id: Uuid| invoices.iter().find(|i| i.id == id).unwrap().status;
    assert_eq!(status(newer.invoice_id), InvoiceStatus::Paid);
    assert_eq!(status(older.invoice_id), InvoiceStatus::Pending);
}

#[tokio::test]
async fn test_bank_statement_token_and_no_match() {
    let h = Harness::new().await;
    let payload = br#"{"operationId":"x","credit":"777.00","purpose":"unrelated"}"#;

    let err = h
        .billing
        .webhooks
        .handle_bank_statement(payload, Some("wrong"), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SignatureInvalid));

    let report = h
        .billing
        .webhooks
        .handle_bank_statement(payload, Some(BANK_TOKEN), NOW)
        .await
        .unwrap();
    assert_eq!(report.operations, 1);
    assert!(report.settled_invoice.is_none());
}

#[tokio::test]
async fn test_sync_renewal_stacks_on_remaining_paid_time() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let period_end = NOW + Duration::days(10);
    let active_id = h.active_until(company, PlanSlug::Team, period_end).await;

    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    h.provider.set_status(&payment.payment_id, PaymentStatus::Succeeded);

    let outcome = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(outcome.activated);

    let rows = h.store.subscriptions();
    assert_eq!(rows.len(), 1, "pending row must be merged away");
    assert_eq!(rows[0].id, active_id);
    assert_eq!(rows[0].current_period_end, Some(add_months(period_end, 1).unwrap()));

    let invoice = &h.store.invoices()[0];
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.subscription_id, active_id);

    // Nothing is left to poll
    let again = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(!again.activated);
}

#[tokio::test]
async fn test_sync_activates_in_place_without_running_subscription() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    h.billing
        .subscriptions
        .activate_free_plan(company, h.plan(PlanSlug::Lite), None)
        .await
        .unwrap();

    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Pro), 3, "https://crm.example", NOW, None)
        .await
        .unwrap();
    h.provider.set_status(&payment.payment_id, PaymentStatus::Succeeded);

    let outcome = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(outcome.activated);

    let effective = h
        .billing
        .subscriptions
        .resolve_current_subscription(company, NOW)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(effective.plan.slug, PlanSlug::Pro);
    assert_eq!(
        effective.subscription.current_period_end,
        Some(add_months(NOW, 3).unwrap())
    );
}

#[tokio::test]
async fn test_sync_timeout_is_not_fatal() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    h.provider.set_status(&payment.payment_id, PaymentStatus::Succeeded);
    h.provider.fail_next(MockFailure::Timeout);

    let outcome = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(!outcome.activated);
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Trial);

    // Next poll succeeds
    let outcome = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(outcome.activated);
}

#[tokio::test]
async fn test_sync_abandons_canceled_payment() {
    let h = Harness::new().await;
    let company = h.store.add_company("Solo", LegalForm::Individual);
    let payment = h
        .billing
        .invoices
        .start_instant_payment(company, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    h.provider.set_status(&payment.payment_id, PaymentStatus::Canceled);

    let outcome = h
        .billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert!(!outcome.activated);
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Canceled);
    assert_eq!(h.store.invoices()[0].status, InvoiceStatus::Failed);

    let calls = h.provider.get_calls();
    h.billing
        .payments
        .sync_pending_payments(company, NOW)
        .await
        .unwrap();
    assert_eq!(h.provider.get_calls(), calls, "abandoned rows are not polled again");
}

#[tokio::test]
async fn test_sync_all_pending_payments() {
    let h = Harness::new().await;
    let paid = h.store.add_company("Paid", LegalForm::Individual);
    let waiting = h.store.add_company("Waiting", LegalForm::Individual);

    let paid_payment = h
        .billing
        .invoices
        .start_instant_payment(paid, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    h.billing
        .invoices
        .start_instant_payment(waiting, h.plan(PlanSlug::Team), 1, "https://crm.example", NOW, None)
        .await
        .unwrap();
    h.provider.set_status(&paid_payment.payment_id, PaymentStatus::Succeeded);

    let report = h
        .billing
        .payments
        .sync_all_pending_payments(NOW)
        .await
        .unwrap();
    assert_eq!(report.companies, 2);
    assert_eq!(report.activated, 1);
    assert_eq!(report.failed, 0);
}

// =============================================================================
// Proration
// =============================================================================

#[tokio::test]
async fn test_preview_proration_for_upgrade() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    h.active_until(company, PlanSlug::Team, NOW + Duration::days(15)).await;

    let proration = h
        .billing
        .subscriptions
        .preview_proration(company, h.plan(PlanSlug::Pro), NOW)
        .await
        .unwrap();
    assert_eq!(proration.remaining_days, 15);
    assert_eq!(proration.credit, 750.0);
    assert_eq!(proration.days_at_new_rate, 9.0);
    assert_eq!(proration.new_period_end, NOW + Duration::days(9));

    // Nothing was written
    assert_eq!(h.store.subscriptions()[0].current_period_end, Some(NOW + Duration::days(15)));

    let err = h
        .billing
        .subscriptions
        .preview_proration(company, h.plan(PlanSlug::Lite), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

// =============================================================================
// Expiry notices
// =============================================================================

#[tokio::test]
async fn test_expiry_notice_sent_once_per_user_per_day() {
    let h = Harness::new().await;
    let company = h.store.add_company("Acme LLC", LegalForm::LegalEntity);
    let users = [h.store.add_user(company), h.store.add_user(company)];
    h.active_until(company, PlanSlug::Team, NOW + Duration::days(2)).await;

    // Outside the window, and a row that is only waiting for payment
    let quiet = h.store.add_company("Quiet LLC", LegalForm::LegalEntity);
    h.store.add_user(quiet);
    h.active_until(quiet, PlanSlug::Team, NOW + Duration::days(6)).await;
    let waiting = h.store.add_company("Waiting LLC", LegalForm::LegalEntity);
    h.store.add_user(waiting);
    h.billing
        .invoices
        .generate_invoice(waiting, h.plan(PlanSlug::Team), 1, NOW - Duration::days(29), None)
        .await
        .unwrap();

    h.sink.set_now(NOW);
    let first = h.billing.expiry.check_expiring_subscriptions(NOW).await.unwrap();
    assert_eq!(first.subscriptions, 1);
    assert_eq!(first.notified, 2);

    h.sink.set_now(NOW + Duration::hours(6));
    let second = h
        .billing
        .expiry
        .check_expiring_subscriptions(NOW + Duration::hours(6))
        .await
        .unwrap();
    assert_eq!(second.notified, 0);
    assert_eq!(second.already_notified, 2);

    let sent = h.sink.sent();
    assert_eq!(sent.len(), 2);
    for user in users {
        assert_eq!(sent.iter().filter(|n| n.user_id == user).count(), 1);
    }
    assert!(sent.iter().all(|n| n.title == EXPIRY_NOTICE_TITLE));
    assert!(sent[0].message.contains("2 day(s)"));

    // Next day warns again
    let tomorrow = NOW + Duration::days(1);
    h.sink.set_now(tomorrow);
    let third = h.billing.expiry.check_expiring_subscriptions(tomorrow).await.unwrap();
    assert_eq!(third.notified, 2);
}
