//! Billing routes for the tenant UI

use axum::{
    extract::{Path, Query, State},
    Json,
};
use dealflow_billing::{
    BillingError, BillingEvent, EffectiveSubscription, GeneratedInvoice, InstantPayment, Invoice,
    Plan, Proration, Settlement, SubscriptionRecord, SyncOutcome,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Request naming a target plan
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    #[serde(alias = "plan_id")]
    pub plan_id: Uuid,
}

/// Request to issue an invoice
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInvoiceRequest {
    #[serde(alias = "plan_id")]
    pub plan_id: Uuid,
    #[serde(alias = "payment_period_months")]
    pub payment_period_months: i32,
}

/// Request to start an instant payment
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPaymentRequest {
    #[serde(alias = "plan_id")]
    pub plan_id: Uuid,
    #[serde(alias = "payment_period_months")]
    pub payment_period_months: i32,
    #[serde(alias = "return_url")]
    pub return_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ProrationQuery {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Response to a manual payment confirmation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentResponse {
    pub already_processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Invoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRecord>,
}

/// List the plan catalog, cheapest first
pub async fn list_plans(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.catalog.list_plans().await?))
}

/// Current effective subscription, `null` when the company has none
pub async fn get_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Option<EffectiveSubscription>>> {
    let effective = state
        .billing
        .subscriptions
        .resolve_current_subscription(auth.company_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(effective))
}

/// Switch the company to a free plan
pub async fn activate_free_plan(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    auth.require_manager()?;

    let record = state
        .billing
        .subscriptions
        .activate_free_plan(auth.company_id, req.plan_id, Some(auth.user_id))
        .await?;
    Ok(Json(record))
}

/// Start the one trial a company gets
pub async fn start_trial(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    auth.require_manager()?;

    let record = state
        .billing
        .subscriptions
        .start_trial(
            auth.company_id,
            req.plan_id,
            OffsetDateTime::now_utc(),
            Some(auth.user_id),
        )
        .await?;
    Ok(Json(record))
}

/// Change the plan of a running trial
pub async fn update_trial_plan(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    auth.require_manager()?;

    let record = state
        .billing
        .subscriptions
        .update_trial_plan(
            auth.company_id,
            req.plan_id,
            OffsetDateTime::now_utc(),
            Some(auth.user_id),
        )
        .await?;
    Ok(Json(record))
}

/// Preview how much paid time a plan switch would leave
pub async fn preview_proration(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ProrationQuery>,
) -> ApiResult<Json<Proration>> {
    let proration = state
        .billing
        .subscriptions
        .preview_proration(auth.company_id, query.plan_id, OffsetDateTime::now_utc())
        .await
        .inspect_err(|e| {
            tracing::info!(
                company_id = %auth.company_id,
                plan_id = %query.plan_id,
                error = %e,
                "Proration preview refused"
            );
        })?;
    Ok(Json(proration))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<Invoice>>> {
    Ok(Json(state.billing.invoices.list_invoices(auth.company_id).await?))
}

/// Issue an invoice for bank transfer (legal entities)
pub async fn generate_invoice(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<GenerateInvoiceRequest>,
) -> ApiResult<Json<GeneratedInvoice>> {
    auth.require_manager()?;

    let invoice = state
        .billing
        .invoices
        .generate_invoice(
            auth.company_id,
            req.plan_id,
            req.payment_period_months,
            OffsetDateTime::now_utc(),
            Some(auth.user_id),
        )
        .await?;
    Ok(Json(invoice))
}

/// Mark an invoice as paid by hand (owner only)
pub async fn confirm_invoice_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<ConfirmPaymentResponse>> {
    auth.require_owner()?;

    let result = state
        .billing
        .payments
        .confirm_invoice_payment(
            Some(auth.company_id),
            invoice_id,
            OffsetDateTime::now_utc(),
            Some(auth.user_id),
        )
        .await;

    match result {
        Ok(Settlement {
            invoice,
            subscription,
        }) => Ok(Json(ConfirmPaymentResponse {
            already_processed: false,
            invoice: Some(invoice),
            subscription: Some(subscription),
        })),
        Err(BillingError::AlreadyProcessed(msg)) => {
            tracing::info!(
                invoice_id = %invoice_id,
                reason = %msg,
                "Manual confirmation of an already processed invoice"
            );
            Ok(Json(ConfirmPaymentResponse {
                already_processed: true,
                invoice: None,
                subscription: None,
            }))
        }
        Err(e) => Err(ApiError::from(e)),
    }
}

/// Start an instant payment (individuals)
pub async fn start_instant_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<StartPaymentRequest>,
) -> ApiResult<Json<InstantPayment>> {
    auth.require_manager()?;

    let payment = state
        .billing
        .invoices
        .start_instant_payment(
            auth.company_id,
            req.plan_id,
            req.payment_period_months,
            &req.return_url,
            OffsetDateTime::now_utc(),
            Some(auth.user_id),
        )
        .await?;
    Ok(Json(payment))
}

/// Poll the provider for this company's pending payments
pub async fn sync_payments(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<SyncOutcome>> {
    let outcome = state
        .billing
        .payments
        .sync_pending_payments(auth.company_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(outcome))
}

/// Billing audit trail, newest first
pub async fn billing_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<BillingEvent>>> {
    let events = state
        .billing
        .billing_history(auth.company_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(events))
}
