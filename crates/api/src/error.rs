//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dealflow_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("No active trial: {0}")]
    NoActiveTrial(String),
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    // Billing errors
    #[error("Payment required: {0}")]
    PaymentRequired(String),
    #[error("Payment provider error")]
    Provider(String),
    #[error("Payment provider timed out")]
    ProviderTimeout,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),
            ApiError::InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::NoActiveTrial(_) => (StatusCode::CONFLICT, "NO_ACTIVE_TRIAL", self.to_string()),
            ApiError::AlreadyProcessed(_) => (StatusCode::CONFLICT, "ALREADY_PROCESSED", self.to_string()),

            // Billing
            ApiError::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", msg.clone()),
            ApiError::Provider(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", self.to_string()),
            ApiError::ProviderTimeout => (StatusCode::GATEWAY_TIMEOUT, "PROVIDER_TIMEOUT", self.to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::PaymentRequired(msg) => ApiError::PaymentRequired(msg),
            BillingError::NoActiveTrial(msg) => ApiError::NoActiveTrial(msg),
            // Only reached when a handler does not special-case replays
            BillingError::AlreadyProcessed(msg) => ApiError::AlreadyProcessed(msg),
            BillingError::SignatureInvalid => ApiError::InvalidSignature,
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Provider(msg) => {
                tracing::error!(error = %msg, "Payment provider error");
                ApiError::Provider(msg)
            }
            BillingError::ProviderTimeout(ms) => {
                tracing::error!(timeout_ms = ms, "Payment provider timed out");
                ApiError::ProviderTimeout
            }
            BillingError::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                ApiError::Database(msg)
            }
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!("Internal billing error: {}", msg);
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
