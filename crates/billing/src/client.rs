//! Billing configuration and the instant-payment provider client

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const DEFAULT_PROVIDER_API_URL: &str = "https://api.payments.example/v3";
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INVOICE_TTL_DAYS: i64 = 30;
const DEFAULT_CURRENCY: &str = "RUB";

/// Retries for idempotent provider reads
const MAX_READ_RETRIES: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for the instant-payment provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub shop_id: String,
    pub secret_key: String,
    /// Upper bound for any single provider call
    pub timeout_ms: u64,
}

impl ProviderConfig {
    pub fn from_env() -> BillingResult<Self> {
        let timeout_ms = match std::env::var("PAYMENT_PROVIDER_TIMEOUT_MS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("PAYMENT_PROVIDER_TIMEOUT_MS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_PROVIDER_TIMEOUT_MS,
        };

        Ok(Self {
            api_url: std::env::var("PAYMENT_PROVIDER_API_URL")
                .unwrap_or_else(|_| DEFAULT_PROVIDER_API_URL.to_string()),
            shop_id: std::env::var("PAYMENT_PROVIDER_SHOP_ID").unwrap_or_default(),
            secret_key: std::env::var("PAYMENT_PROVIDER_SECRET_KEY").unwrap_or_default(),
            timeout_ms,
        })
    }
}

/// Configuration for the billing engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub provider: ProviderConfig,
    /// Shared secret for instant-payment webhook signatures. `None` disables verification.
    pub webhook_secret: Option<String>,
    /// Token the bank-statement webhook must present. `None` disables the check.
    pub bank_webhook_token: Option<String>,
    /// Age after which a PENDING invoice is failed by the stale-invoice sweep
    pub invoice_ttl_days: i64,
    /// Currency of the seeded catalog
    pub currency: String,
    /// Base URL for links handed to tenants
    pub public_url: String,
    /// Base URL of the CRM document service that renders invoice PDFs by number.
    /// `None` means `{public_url}/invoices`.
    pub invoice_documents_url: Option<String>,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let invoice_ttl_days = match std::env::var("INVOICE_TTL_DAYS") {
            Ok(raw) => raw.parse().ok().filter(|days: &i64| *days > 0).ok_or_else(|| {
                BillingError::Config(format!("INVOICE_TTL_DAYS must be a positive number: {}", raw))
            })?,
            Err(_) => DEFAULT_INVOICE_TTL_DAYS,
        };

        Ok(Self {
            provider: ProviderConfig::from_env()?,
            webhook_secret: non_empty_var("PAYMENT_WEBHOOK_SECRET"),
            bank_webhook_token: non_empty_var("BANK_WEBHOOK_TOKEN"),
            invoice_ttl_days,
            currency: std::env::var("BILLING_CURRENCY")
                .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string()),
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            invoice_documents_url: non_empty_var("INVOICE_DOCUMENTS_URL"),
        })
    }

    /// Link to the rendered PDF of an invoice. The PDF itself is served by the
    /// document service, not by this engine.
    pub fn invoice_pdf_url(&self, invoice_number: &str) -> String {
        let base = match self.invoice_documents_url.as_deref() {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}/invoices", self.public_url.trim_end_matches('/')),
        };
        format!("{}/{}.pdf", base, invoice_number)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                api_url: DEFAULT_PROVIDER_API_URL.to_string(),
                shop_id: String::new(),
                secret_key: String::new(),
                timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
            },
            webhook_secret: None,
            bank_webhook_token: None,
            invoice_ttl_days: DEFAULT_INVOICE_TTL_DAYS,
            currency: DEFAULT_CURRENCY.to_string(),
            public_url: "http://localhost:3000".to_string(),
            invoice_documents_url: None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// =============================================================================
// Provider API
// =============================================================================

/// Provider-side payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    WaitingForCapture,
    Succeeded,
    Canceled,
    #[serde(other)]
    Unknown,
}

/// Payment creation request
#[derive(Debug, Clone)]
pub struct CreatePayment {
    /// Amount in major currency units
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub return_url: String,
    /// Our invoice id, echoed back by the provider in metadata
    pub invoice_id: Uuid,
}

/// Payment as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPayment {
    pub id: String,
    pub status: PaymentStatus,
    pub confirmation_url: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment(&self, request: CreatePayment) -> BillingResult<ProviderPayment>;
    async fn get_payment(&self, payment_id: &str) -> BillingResult<ProviderPayment>;
}

#[derive(Debug, Serialize)]
struct AmountBody {
    value: String,
    currency: String,
}

#[derive(Debug, Serialize)]
struct ConfirmationRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    return_url: String,
}

#[derive(Debug, Serialize)]
struct CreatePaymentBody {
    amount: AmountBody,
    capture: bool,
    confirmation: ConfirmationRequest,
    description: String,
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ConfirmationResponse {
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    status: PaymentStatus,
    confirmation: Option<ConfirmationResponse>,
}

impl From<PaymentResponse> for ProviderPayment {
    fn from(response: PaymentResponse) -> Self {
        Self {
            id: response.id,
            status: response.status,
            confirmation_url: response.confirmation.and_then(|c| c.confirmation_url),
        }
    }
}

/// HTTP client for the instant-payment provider
#[derive(Clone)]
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpPaymentProvider {
    pub fn new(config: ProviderConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(ProviderConfig::from_env()?)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> BillingError {
        if err.is_timeout() {
            BillingError::ProviderTimeout(self.config.timeout_ms)
        } else {
            BillingError::Provider(err.to_string())
        }
    }

    async fn parse_response(&self, response: reqwest::Response) -> BillingResult<ProviderPayment> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "Provider returned {}: {}",
                status, body
            )));
        }
        let payment: PaymentResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        Ok(payment.into())
    }

    async fn fetch_payment_once(&self, payment_id: &str) -> BillingResult<ProviderPayment> {
        let response = self
            .client
            .get(format!("{}/payments/{}", self.config.api_url, payment_id))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        self.parse_response(response).await
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_payment(&self, request: CreatePayment) -> BillingResult<ProviderPayment> {
        let body = CreatePaymentBody {
            amount: AmountBody {
                value: format!("{}.00", request.amount),
                currency: request.currency,
            },
            capture: true,
            confirmation: ConfirmationRequest {
                kind: "redirect",
                return_url: request.return_url,
            },
            description: request.description,
            metadata: serde_json::json!({ "invoice_id": request.invoice_id }),
        };

        // Never retried: the idempotence key makes a manual retry safe, a blind one is not needed
        let response = self
            .client
            .post(format!("{}/payments", self.config.api_url))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .header("Idempotence-Key", request.invoice_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        self.parse_response(response).await
    }

    async fn get_payment(&self, payment_id: &str) -> BillingResult<ProviderPayment> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_READ_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.fetch_payment_once(payment_id).await;
            match &result {
                // Timeouts are not retried so the overall wait stays bounded
                Err(BillingError::Provider(e)) => {
                    tracing::debug!(payment_id = %payment_id, error = %e, "Transient provider error - will retry");
                    Err(result)
                }
                _ => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}

// =============================================================================
// Test double
// =============================================================================

#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockFailure, MockPaymentProvider};

#[cfg(any(test, feature = "test-util"))]
mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use super::*;

    /// Failure to inject into the next provider call
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockFailure {
        Timeout,
        Unavailable,
    }

    #[derive(Default)]
    struct MockState {
        payments: HashMap<String, PaymentStatus>,
        created: Vec<CreatePayment>,
        fail_next: Option<MockFailure>,
        get_calls: usize,
    }

    /// Scriptable payment provider for tests
    #[derive(Default, Clone)]
    pub struct MockPaymentProvider {
        inner: Arc<Mutex<MockState>>,
    }

    impl MockPaymentProvider {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, MockState> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Set the status the provider reports for a payment
        pub fn set_status(&self, payment_id: &str, status: PaymentStatus) {
            self.lock().payments.insert(payment_id.to_string(), status);
        }

        /// Make the next call fail
        pub fn fail_next(&self, failure: MockFailure) {
            self.lock().fail_next = Some(failure);
        }

        /// Payments created so far
        pub fn created(&self) -> Vec<CreatePayment> {
            self.lock().created.clone()
        }

        pub fn get_calls(&self) -> usize {
            self.lock().get_calls
        }

        fn take_failure(state: &mut MockState) -> BillingResult<()> {
            match state.fail_next.take() {
                Some(MockFailure::Timeout) => Err(BillingError::ProviderTimeout(DEFAULT_PROVIDER_TIMEOUT_MS)),
                Some(MockFailure::Unavailable) => {
                    Err(BillingError::Provider("Provider returned 503".to_string()))
                }
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl PaymentProvider for MockPaymentProvider {
        async fn create_payment(&self, request: CreatePayment) -> BillingResult<ProviderPayment> {
            let mut state = self.lock();
            Self::take_failure(&mut state)?;

            let id = format!("mock-pay-{}", state.created.len() + 1);
            state.payments.insert(id.clone(), PaymentStatus::Pending);
            state.created.push(request);
            Ok(ProviderPayment {
                confirmation_url: Some(format!("https://pay.example/confirm/{}", id)),
                id,
                status: PaymentStatus::Pending,
            })
        }

        async fn get_payment(&self, payment_id: &str) -> BillingResult<ProviderPayment> {
            let mut state = self.lock();
            state.get_calls += 1;
            Self::take_failure(&mut state)?;

            let status = state
                .payments
                .get(payment_id)
                .copied()
                .ok_or_else(|| BillingError::Provider(format!("Unknown payment {}", payment_id)))?;
            Ok(ProviderPayment {
                id: payment_id.to_string(),
                status,
                confirmation_url: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_pdf_url() {
        let mut config = BillingConfig {
            public_url: "https://crm.example/".to_string(),
            ..BillingConfig::default()
        };
        assert_eq!(
            config.invoice_pdf_url("INV-20240510-0001"),
            "https://crm.example/invoices/INV-20240510-0001.pdf"
        );

        config.invoice_documents_url = Some("https://docs.crm.example/billing/".to_string());
        assert_eq!(
            config.invoice_pdf_url("INV-20240510-0001"),
            "https://docs.crm.example/billing/INV-20240510-0001.pdf"
        );
    }

    #[test]
    fn test_payment_status_parsing() {
        let status: PaymentStatus = serde_json::from_str("\"succeeded\"").unwrap();
        assert_eq!(status, PaymentStatus::Succeeded);
        let status: PaymentStatus = serde_json::from_str("\"waiting_for_capture\"").unwrap();
        assert_eq!(status, PaymentStatus::WaitingForCapture);
        let status: PaymentStatus = serde_json::from_str("\"refunded\"").unwrap();
        assert_eq!(status, PaymentStatus::Unknown);
    }

    #[test]
    fn test_payment_response_mapping() {
        let raw = r#"{
            "id": "2c5d8f1a-000f-5000-9000-1b2c3d4e5f60",
            "status": "pending",
            "confirmation": {"type": "redirect", "confirmation_url": "https://pay.example/c/1"}
        }"#;
        let payment: ProviderPayment = serde_json::from_str::<PaymentResponse>(raw).unwrap().into();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(
            payment.confirmation_url.as_deref(),
            Some("https://pay.example/c/1")
        );
    }

    #[test]
    fn test_default_config() {
        let config = BillingConfig::default();
        assert_eq!(config.invoice_ttl_days, 30);
        assert_eq!(config.currency, "RUB");
        assert!(config.webhook_secret.is_none());
    }

    #[tokio::test]
    async fn test_mock_provider_lifecycle() {
        let provider = MockPaymentProvider::new();
        let payment = provider
            .create_payment(CreatePayment {
                amount: 1500,
                currency: "RUB".into(),
                description: "INV-20240501-0001".into(),
                return_url: "https://app.example/billing".into(),
                invoice_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        provider.set_status(&payment.id, PaymentStatus::Succeeded);
        let fetched = provider.get_payment(&payment.id).await.unwrap();
        assert_eq!(fetched.status, PaymentStatus::Succeeded);

        provider.fail_next(MockFailure::Timeout);
        let err = provider.get_payment(&payment.id).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderTimeout(_)));
    }
}
