//! Proration calculator
//!
//! Converts the unused time left under an old monthly price into the equivalent
//! amount of time under a new monthly price. A month is normalised to
//! [`DAYS_IN_BILLING_MONTH`] days; this is not calendar-accurate.
//!
//! The calculator has no side effects. Callers decide whether to apply the result.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// Length of a billing month for proration purposes
pub const DAYS_IN_BILLING_MONTH: i64 = 30;

const SECONDS_PER_DAY: i64 = 86_400;

/// Result of a proration calculation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proration {
    /// Whole days left in the current period (partial days round up, never negative)
    pub remaining_days: i64,
    /// Value of the remaining days at the old price
    pub credit: f64,
    /// How many days the credit buys at the new price
    pub days_at_new_rate: f64,
    /// `now + days_at_new_rate`
    #[serde(with = "time::serde::rfc3339")]
    pub new_period_end: OffsetDateTime,
}

/// Compute the period end after switching from `old_price_per_month` to
/// `new_price_per_month` at `now`.
pub fn calculate_prorated_period_end(
    now: OffsetDateTime,
    current_period_end: OffsetDateTime,
    old_price_per_month: i64,
    new_price_per_month: i64,
    days_in_month: i64,
) -> BillingResult<Proration> {
    if new_price_per_month <= 0 {
        return Err(BillingError::Validation(
            "Proration requires a plan with a positive price".to_string(),
        ));
    }
    if old_price_per_month < 0 || days_in_month <= 0 {
        return Err(BillingError::Validation(format!(
            "Invalid proration input: old price {}, month length {}",
            old_price_per_month, days_in_month
        )));
    }

    let remaining_seconds = (current_period_end - now).whole_seconds().max(0);
    let remaining_days = (remaining_seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;

    // Multiply before dividing so exact inputs produce exact outputs
    let credit = (old_price_per_month as f64 * remaining_days as f64) / days_in_month as f64;
    let days_at_new_rate = (credit * days_in_month as f64) / new_price_per_month as f64;

    let offset = Duration::seconds((days_at_new_rate * SECONDS_PER_DAY as f64).round() as i64);
    let new_period_end = now.checked_add(offset).ok_or_else(|| {
        BillingError::Validation("Prorated period end is out of range".to_string())
    })?;

    Ok(Proration {
        remaining_days,
        credit,
        days_at_new_rate,
        new_period_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_upgrade_shortens_period() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let result =
            calculate_prorated_period_end(now, now + Duration::days(15), 1500, 2500, 30).unwrap();

        assert_eq!(result.remaining_days, 15);
        assert_eq!(result.credit, 750.0);
        assert_eq!(result.days_at_new_rate, 9.0);
        assert_eq!(result.new_period_end, now + Duration::days(9));
    }

    #[test]
    fn test_downgrade_extends_period() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let result =
            calculate_prorated_period_end(now, now + Duration::days(10), 2500, 1500, 30).unwrap();

        assert_eq!(result.remaining_days, 10);
        assert!((result.credit - 833.333).abs() < 0.01);
        assert!((result.days_at_new_rate - 16.666).abs() < 0.01);
        assert!(result.new_period_end > now + Duration::days(16));
        assert!(result.new_period_end < now + Duration::days(17));
    }

    #[test]
    fn test_partial_day_rounds_up() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let result = calculate_prorated_period_end(
            now,
            now + Duration::days(2) + Duration::hours(1),
            3000,
            3000,
            30,
        )
        .unwrap();
        assert_eq!(result.remaining_days, 3);
        assert_eq!(result.days_at_new_rate, 3.0);
    }

    #[test]
    fn test_expired_period_gives_no_credit() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let result =
            calculate_prorated_period_end(now, now - Duration::days(3), 1500, 2500, 30).unwrap();
        assert_eq!(result.remaining_days, 0);
        assert_eq!(result.credit, 0.0);
        assert_eq!(result.new_period_end, now);
    }

    #[test]
    fn test_free_target_plan_is_rejected() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let err = calculate_prorated_period_end(now, now + Duration::days(5), 1500, 0, 30)
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
