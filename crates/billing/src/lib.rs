// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Dealflow Billing Module
//!
//! Subscription and billing lifecycle of a Dealflow tenant.
//!
//! ## Features
//!
//! - **Plan Catalog**: fixed LITE / TEAM / PRO plan set keyed by slug
//! - **State Resolver**: the one effective subscription of a company
//! - **Plan Changes**: free-plan activation, trials and trial plan switches
//! - **Invoicing**: legal-entity invoices with `INV-YYYYMMDD-NNNN` numbering
//! - **Instant Payments**: provider-backed payments for individuals
//! - **Reconciliation**: manual confirmation, provider webhook, bank statements, polling
//! - **Proration**: converting remaining paid time between prices
//! - **Expiry Notices**: once-a-day warnings before a subscription runs out

pub mod catalog;
pub mod client;
pub mod error;
pub mod events;
pub mod expiry;
pub mod invoices;
pub mod notify;
pub mod numbering;
pub mod payments;
pub mod period;
pub mod proration;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod lifecycle_tests;

// Catalog
pub use catalog::{default_plans, PlanCatalog, TRIAL_DAYS};

// Client
pub use client::{
    BillingConfig, CreatePayment, HttpPaymentProvider, PaymentProvider, PaymentStatus,
    ProviderConfig, ProviderPayment,
};
#[cfg(any(test, feature = "test-util"))]
pub use client::{MockFailure, MockPaymentProvider};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventType};

// Expiry
pub use expiry::{ExpiryNotifier, ExpiryReport, EXPIRY_NOTICE_TITLE};

// Invoices
pub use invoices::{GeneratedInvoice, InstantPayment, InvoiceService};

// Notifications
pub use notify::{NotificationSink, PgNotificationSink};
#[cfg(any(test, feature = "test-util"))]
pub use notify::{MemoryNotificationSink, SentNotification};

// Payments
pub use payments::{BankOperation, BankSettlementReport, PaymentReconciler, SyncOutcome, SyncReport};

// Proration
pub use proration::{calculate_prorated_period_end, Proration, DAYS_IN_BILLING_MONTH};

// Store
pub use store::{
    BillingStore, Company, Invoice, PgBillingStore, Plan, Settlement, StaleSweep,
    SubscriptionRecord,
};
#[cfg(any(test, feature = "test-util"))]
pub use store::memory::MemoryBillingStore;

// Subscriptions
pub use subscriptions::{
    resolve_effective, EffectiveSubscription, SubscriptionService, SubscriptionState,
};

// Webhooks
pub use webhooks::{PaymentWebhookOutcome, WebhookHandler, BANK_TOKEN_HEADER, SIGNATURE_HEADERS};

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub catalog: PlanCatalog,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub payments: PaymentReconciler,
    pub webhooks: WebhookHandler,
    pub expiry: ExpiryNotifier,
    pub config: BillingConfig,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let provider = HttpPaymentProvider::new(config.provider.clone())?;

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool.clone())),
            Arc::new(provider),
            Arc::new(PgNotificationSink::new(pool)),
            config,
        ))
    }

    /// Create a new billing service from explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn NotificationSink>,
        config: BillingConfig,
    ) -> Self {
        let catalog = PlanCatalog::new(store.clone(), config.currency.clone());
        let payments = PaymentReconciler::new(store.clone(), provider.clone());

        Self {
            subscriptions: SubscriptionService::new(store.clone(), catalog.clone()),
            invoices: InvoiceService::new(
                store.clone(),
                catalog.clone(),
                provider,
                config.clone(),
            ),
            webhooks: WebhookHandler::new(payments.clone(), &config),
            expiry: ExpiryNotifier::new(store.clone(), notifier),
            payments,
            catalog,
            store,
            config,
        }
    }

    /// Most recent audit events of a company
    pub async fn billing_history(
        &self,
        company_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.store.list_events(company_id, limit.clamp(1, 500)).await
    }
}
