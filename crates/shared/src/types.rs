//! Common types used across Dealflow

use serde::{Deserialize, Serialize};

use crate::error::DealflowError;

// =============================================================================
// Enums
// =============================================================================

/// Pricing tier slug, the stable key of the plan catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanSlug {
    Lite,
    Team,
    Pro,
}

impl PlanSlug {
    pub const ALL: [PlanSlug; 3] = [PlanSlug::Lite, PlanSlug::Team, PlanSlug::Pro];
}

impl std::fmt::Display for PlanSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lite => write!(f, "LITE"),
            Self::Team => write!(f, "TEAM"),
            Self::Pro => write!(f, "PRO"),
        }
    }
}

impl std::str::FromStr for PlanSlug {
    type Err = DealflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LITE" => Ok(Self::Lite),
            "TEAM" => Ok(Self::Team),
            "PRO" => Ok(Self::Pro),
            _ => Err(DealflowError::Validation(format!("Invalid plan slug: {}", s))),
        }
    }
}

/// Stored subscription status.
///
/// `Trial` is overloaded at the storage level: it marks both a genuine trial and a
/// subscription waiting for its first payment. The billing crate decodes the two
/// meanings into distinct states before any decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "TRIAL"),
            Self::Active => write!(f, "ACTIVE"),
            Self::PastDue => write!(f, "PAST_DUE"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = DealflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRIAL" => Ok(Self::Trial),
            "ACTIVE" => Ok(Self::Active),
            "PAST_DUE" => Ok(Self::PastDue),
            "CANCELED" => Ok(Self::Canceled),
            _ => Err(DealflowError::Validation(format!(
                "Invalid subscription status: {}",
                s
            ))),
        }
    }
}

/// Invoice payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Paid => write!(f, "PAID"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Billing interval of a subscription (only monthly billing exists today)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BillingInterval {
    #[default]
    Monthly,
}

/// How a company pays: instant payment provider or invoice + bank transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegalForm {
    Individual,
    LegalEntity,
}

impl LegalForm {
    pub fn is_legal_entity(&self) -> bool {
        matches!(self, Self::LegalEntity)
    }
}

// =============================================================================
// Value Types
// =============================================================================

/// Number of months an invoice pays for. Only 1, 3, 6 and 12 are sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct PaymentPeriod(u8);

impl PaymentPeriod {
    pub const ALLOWED: [u8; 4] = [1, 3, 6, 12];

    pub fn months(&self) -> u32 {
        u32::from(self.0)
    }
}

impl TryFrom<i32> for PaymentPeriod {
    type Error = DealflowError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match u8::try_from(value) {
            Ok(months) if Self::ALLOWED.contains(&months) => Ok(Self(months)),
            _ => Err(DealflowError::Validation(format!(
                "Invalid payment period: {} (allowed: 1, 3, 6, 12 months)",
                value
            ))),
        }
    }
}

impl From<PaymentPeriod> for i32 {
    fn from(period: PaymentPeriod) -> Self {
        i32::from(period.0)
    }
}

impl std::fmt::Display for PaymentPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} month(s)", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_slug_roundtrip() {
        for slug in PlanSlug::ALL {
            assert_eq!(slug.to_string().parse::<PlanSlug>().unwrap(), slug);
        }
        assert!("enterprise".parse::<PlanSlug>().is_err());
    }

    #[test]
    fn test_subscription_status_parse_is_case_insensitive() {
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "PAST_DUE");
    }

    #[test]
    fn test_payment_period_allows_only_sold_durations() {
        for months in [1, 3, 6, 12] {
            assert_eq!(PaymentPeriod::try_from(months).unwrap().months(), months as u32);
        }
        for months in [0, 2, 4, 13, -1, 300] {
            assert!(PaymentPeriod::try_from(months).is_err(), "{} accepted", months);
        }
    }

    #[test]
    fn test_payment_period_serde() {
        let period: PaymentPeriod = serde_json::from_str("6").unwrap();
        assert_eq!(period.months(), 6);
        assert!(serde_json::from_str::<PaymentPeriod>("5").is_err());
        assert_eq!(serde_json::to_string(&period).unwrap(), "6");
    }
}
