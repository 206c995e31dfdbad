//! Payment webhooks
//!
//! Both endpoints answer 200 for anything that is not a signature failure or an
//! unexpected error, so senders stop retrying deliveries that cannot match.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use dealflow_billing::{
    BankSettlementReport, BillingError, PaymentWebhookOutcome, BANK_TOKEN_HEADER,
    SIGNATURE_HEADERS,
};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{error::ApiError, state::AppState};

fn webhook_error(source: &str, err: BillingError) -> ApiError {
    match err {
        BillingError::SignatureInvalid => ApiError::InvalidSignature,
        other => {
            tracing::error!(source = source, error = %other, "Webhook handling error");
            ApiError::Internal
        }
    }
}

/// Instant-payment provider notifications
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    tracing::info!(body_len = body.len(), "Payment webhook received");

    let signatures: Vec<&str> = SIGNATURE_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .collect();

    let outcome = state
        .billing
        .webhooks
        .handle_payment_notification(&body, &signatures, OffsetDateTime::now_utc())
        .await
        .map_err(|e| webhook_error("payment", e))?;

    let body = match outcome {
        PaymentWebhookOutcome::Settled { invoice_number } => {
            tracing::info!(invoice_number = %invoice_number, "Payment webhook settled invoice");
            json!({"received": true, "status": "settled", "invoiceNumber": invoice_number})
        }
        PaymentWebhookOutcome::Failed { invoice_number } => {
            json!({"received": true, "status": "failed", "invoiceNumber": invoice_number})
        }
        PaymentWebhookOutcome::Ignored { reason } => {
            json!({"received": true, "status": "ignored", "reason": reason})
        }
    };
    Ok(Json(body))
}

/// Bank-statement deliveries
pub async fn bank_statement_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BankSettlementReport>, ApiError> {
    tracing::info!(body_len = body.len(), "Bank statement webhook received");

    let token = headers.get(BANK_TOKEN_HEADER).and_then(|v| v.to_str().ok());

    let report = state
        .billing
        .webhooks
        .handle_bank_statement(&body, token, OffsetDateTime::now_utc())
        .await
        .map_err(|e| webhook_error("bank", e))?;
    Ok(Json(report))
}
