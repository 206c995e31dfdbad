//! API routes

pub mod billing;
pub mod health;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Default request body cap, matching `MAX_REQUEST_BODY_BYTES`
pub const DEFAULT_BODY_LIMIT: usize = 1_048_576;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    create_router_with_limit(state, DEFAULT_BODY_LIMIT)
}

/// Create all API routes with an explicit request body cap
pub fn create_router_with_limit(state: AppState, body_limit: usize) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Tenant billing routes; identity comes from gateway headers
    let billing_routes = Router::new()
        .route("/plans", get(billing::list_plans))
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/free", post(billing::activate_free_plan))
        .route(
            "/subscription/trial",
            post(billing::start_trial).patch(billing::update_trial_plan),
        )
        .route("/proration", get(billing::preview_proration))
        .route(
            "/invoices",
            get(billing::list_invoices).post(billing::generate_invoice),
        )
        .route(
            "/invoices/:invoice_id/confirm",
            post(billing::confirm_invoice_payment),
        )
        .route("/payments", post(billing::start_instant_payment))
        .route("/payments/sync", post(billing::sync_payments))
        .route("/events", get(billing::billing_history));

    // Webhooks authenticate by signature or token, not by identity headers
    let webhook_routes = Router::new()
        .route("/payments", post(webhooks::payment_webhook))
        .route("/bank-statement", post(webhooks::bank_statement_webhook));

    let api_routes = Router::new()
        .nest("/billing", billing_routes)
        .nest("/webhooks", webhook_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
