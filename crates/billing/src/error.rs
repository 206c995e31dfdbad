//! Billing error types

use dealflow_shared::DealflowError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("No active trial for company {0}")]
    NoActiveTrial(String),

    #[error("Invoice already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Payment provider did not answer within {0} ms")]
    ProviderTimeout(u64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Business-logic mismatches that webhook callers must acknowledge with a success status
    pub fn is_business_mismatch(&self) -> bool {
        matches!(
            self,
            BillingError::NotFound(_)
                | BillingError::AlreadyProcessed(_)
                | BillingError::Validation(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Provider(err.to_string())
    }
}

impl From<DealflowError> for BillingError {
    fn from(err: DealflowError) -> Self {
        match err {
            DealflowError::NotFound(msg) => BillingError::NotFound(msg),
            DealflowError::Validation(msg) => BillingError::Validation(msg),
            DealflowError::Database(e) => BillingError::Database(e.to_string()),
            DealflowError::Migration(e) => BillingError::Database(e.to_string()),
        }
    }
}

impl From<time::error::ComponentRange> for BillingError {
    fn from(err: time::error::ComponentRange) -> Self {
        BillingError::Internal(format!("Date out of range: {}", err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
