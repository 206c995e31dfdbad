//! Webhook handling
//!
//! Handles instant-payment provider notifications and bank-statement deliveries.
//! Both handlers only verify, parse and run a single matching step; business
//! mismatches (unknown payment, no matching invoice, replay) are logged and
//! acknowledged so the sender does not retry them.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::client::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::payments::{BankOperation, BankSettlementReport, PaymentReconciler};

type HmacSha256 = Hmac<Sha256>;

/// Headers the provider has been seen to carry its signature in
pub const SIGNATURE_HEADERS: [&str; 4] = [
    "x-payment-signature",
    "x-webhook-signature",
    "x-signature",
    "signature",
];

/// Header carrying the bank-statement shared token
pub const BANK_TOKEN_HEADER: &str = "x-webhook-token";

/// Verify a hex HMAC-SHA256 of `payload`, optionally prefixed with `sha256=`
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> BillingResult<()> {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex::decode(signature).map_err(|_| BillingError::SignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| BillingError::SignatureInvalid)
}

/// Constant-time token comparison
fn tokens_match(expected: &str, presented: &str) -> bool {
    if expected.len() != presented.len() {
        // Same amount of work as a real comparison, so the length does not leak
        let dummy = vec![0u8; expected.len()];
        let _ = expected.as_bytes().ct_eq(&dummy);
        return false;
    }

    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

// =============================================================================
// Payloads
// =============================================================================

/// Instant-payment notification body
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub event: String,
    pub object: PaymentObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Amount as sent by banks: a JSON number or a decimal string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

impl RawAmount {
    fn value(&self) -> Option<f64> {
        match self {
            RawAmount::Number(n) => Some(*n),
            RawAmount::Text(s) => s.trim().replace(',', ".").parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawOperationId {
    Text(String),
    Number(i64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBankOperation {
    #[serde(default, alias = "operation_id", alias = "id")]
    operation_id: Option<RawOperationId>,
    #[serde(default)]
    credit: Option<RawAmount>,
    #[serde(default)]
    amount: Option<RawAmount>,
    #[serde(default, alias = "pay_purpose")]
    pay_purpose: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
}

impl RawBankOperation {
    fn into_operation(self) -> Option<BankOperation> {
        let credit = self
            .credit
            .as_ref()
            .and_then(RawAmount::value)
            .or_else(|| self.amount.as_ref().and_then(RawAmount::value))?;
        let purpose = self
            .pay_purpose
            .or(self.description)
            .or(self.purpose)
            .unwrap_or_default();
        let operation_id = self.operation_id.map(|id| match id {
            RawOperationId::Text(s) => s,
            RawOperationId::Number(n) => n.to_string(),
        });
        Some(BankOperation {
            operation_id,
            credit,
            purpose,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BankStatementPayload {
    Batch { operations: Vec<RawBankOperation> },
    Single(RawBankOperation),
}

/// Parse a bank-statement delivery: `{"operations": [...]}` or one flattened operation.
/// Operations without a readable amount are dropped.
pub fn parse_bank_statement(payload: &[u8]) -> BillingResult<Vec<BankOperation>> {
    let parsed: BankStatementPayload = serde_json::from_slice(payload)
        .map_err(|e| BillingError::Validation(format!("Malformed bank statement: {}", e)))?;
    let raw = match parsed {
        BankStatementPayload::Batch { operations } => operations,
        BankStatementPayload::Single(operation) => vec![operation],
    };
    Ok(raw
        .into_iter()
        .filter_map(RawBankOperation::into_operation)
        .collect())
}

// =============================================================================
// Handler
// =============================================================================

/// What a payment notification led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentWebhookOutcome {
    Settled { invoice_number: String },
    Failed { invoice_number: String },
    /// Acknowledged without a state change
    Ignored { reason: String },
}

/// Webhook handler for payment notifications
#[derive(Clone)]
pub struct WebhookHandler {
    reconciler: PaymentReconciler,
    webhook_secret: Option<String>,
    bank_token: Option<String>,
}

impl WebhookHandler {
    pub fn new(reconciler: PaymentReconciler, config: &BillingConfig) -> Self {
        Self {
            reconciler,
            webhook_secret: config.webhook_secret.clone(),
            bank_token: config.bank_webhook_token.clone(),
        }
    }

    /// Verification is mandatory when a secret is configured. Any one of the
    /// presented signatures must match.
    pub fn verify_payment_signature(&self, payload: &[u8], signatures: &[&str]) -> BillingResult<()> {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return Ok(());
        };
        if signatures.is_empty() {
            tracing::warn!("Payment webhook without signature header rejected");
            return Err(BillingError::SignatureInvalid);
        }
        if signatures
            .iter()
            .any(|sig| verify_signature(secret, payload, sig).is_ok())
        {
            Ok(())
        } else {
            tracing::warn!(
                payload_len = payload.len(),
                "Payment webhook signature mismatch, possible forged request"
            );
            Err(BillingError::SignatureInvalid)
        }
    }

    /// Verify and apply an instant-payment notification.
    ///
    /// Returns `Err` only for signature failures and unexpected errors.
    pub async fn handle_payment_notification(
        &self,
        payload: &[u8],
        signatures: &[&str],
        now: OffsetDateTime,
    ) -> BillingResult<PaymentWebhookOutcome> {
        self.verify_payment_signature(payload, signatures)?;

        let notification: PaymentNotification = match serde_json::from_slice(payload) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable payment notification acknowledged");
                return Ok(PaymentWebhookOutcome::Ignored {
                    reason: "malformed payload".to_string(),
                });
            }
        };
        let payment_id = notification.object.id.as_str();

        let result = match notification.event.as_str() {
            "payment.succeeded" => self
                .reconciler
                .settle_by_external_id(payment_id, now)
                .await
                .map(|s| PaymentWebhookOutcome::Settled {
                    invoice_number: s.invoice.invoice_number,
                }),
            "payment.canceled" => self
                .reconciler
                .fail_by_external_id(payment_id)
                .await
                .map(|invoice| PaymentWebhookOutcome::Failed {
                    invoice_number: invoice.invoice_number,
                }),
            other => {
                tracing::info!(event = %other, payment_id = %payment_id, "Unhandled payment event");
                Ok(PaymentWebhookOutcome::Ignored {
                    reason: format!("unhandled event {}", other),
                })
            }
        };

        match result {
            Err(e) if e.is_business_mismatch() => {
                tracing::warn!(
                    event = %notification.event,
                    payment_id = %payment_id,
                    error = %e,
                    "Payment notification did not match a pending invoice"
                );
                Ok(PaymentWebhookOutcome::Ignored {
                    reason: e.to_string(),
                })
            }
            other => other,
        }
    }

    /// Check the bank token (when configured), parse and settle.
    pub async fn handle_bank_statement(
        &self,
        payload: &[u8],
        token: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<BankSettlementReport> {
        if let Some(expected) = self.bank_token.as_deref() {
            let presented = token.unwrap_or_default();
            if !tokens_match(expected, presented) {
                tracing::warn!("Bank statement webhook token mismatch, possible forged request");
                return Err(BillingError::SignatureInvalid);
            }
        }

        let operations = match parse_bank_statement(payload) {
            Ok(operations) => operations,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable bank statement acknowledged");
                return Ok(BankSettlementReport::default());
            }
        };

        self.reconciler.settle_bank_operations(&operations, now).await
    }
}
