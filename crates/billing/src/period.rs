//! Calendar helpers for billing periods

use time::{Date, Month, OffsetDateTime, Time};

use crate::error::BillingResult;

/// Add whole calendar months, clamping the day to the end of the target month
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: u32) -> BillingResult<OffsetDateTime> {
    let date = at.date();
    let total = date.year() * 12 + (i32::from(u8::from(date.month())) - 1) + months as i32;
    let year = total.div_euclid(12);
    let month = Month::try_from((total.rem_euclid(12) + 1) as u8)?;
    let day = date.day().min(time::util::days_in_year_month(year, month));

    Ok(at.replace_date(Date::from_calendar_date(year, month, day)?))
}

/// Midnight UTC of the day containing `at`
pub fn start_of_day(at: OffsetDateTime) -> OffsetDateTime {
    at.to_offset(time::UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}
