//! Invoice numbering
//!
//! Invoice numbers have the form `INV-YYYYMMDD-NNNN`: the issue date followed by a
//! four-digit, zero-padded sequence that restarts every day. The format is printed on
//! invoice documents and matched against bank-transfer purposes, so it must not change.
//!
//! Sequence values come from an atomic per-day counter in the store; this module only
//! formats and parses.

use time::Date;

use crate::error::{BillingError, BillingResult};

pub const INVOICE_NUMBER_PREFIX: &str = "INV";

/// Highest sequence value that fits the four-digit suffix
pub const MAX_DAILY_SEQUENCE: u32 = 9_999;

/// `YYYYMMDD` form of a date
pub fn date_stamp(date: Date) -> String {
    format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Prefix shared by every invoice issued on `date`, e.g. `INV-20240501-`
pub fn daily_prefix(date: Date) -> String {
    format!("{}-{}-", INVOICE_NUMBER_PREFIX, date_stamp(date))
}

/// Format the invoice number for the `sequence`-th invoice issued on `date`
pub fn format_invoice_number(date: Date, sequence: u32) -> BillingResult<String> {
    if sequence == 0 || sequence > MAX_DAILY_SEQUENCE {
        return Err(BillingError::Internal(format!(
            "Daily invoice sequence out of range: {}",
            sequence
        )));
    }
    Ok(format!("{}{:04}", daily_prefix(date), sequence))
}

/// Extract the daily sequence from an invoice number, if it is well formed
pub fn parse_sequence(invoice_number: &str) -> Option<u32> {
    let mut parts = invoice_number.split('-');
    let (prefix, stamp, seq) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some()
        || prefix != INVOICE_NUMBER_PREFIX
        || stamp.len() != 8
        || seq.len() != 4
        || !stamp.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    seq.parse().ok().filter(|n| *n > 0)
}
