//! Calendar conversion and card-expiry arithmetic.
//!
//! Card expiry checks work on whole calendar months: a card whose expiry
//! month equals the current month is already unusable for renewals, so it
//! counts as expired here.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

/// Convert a provider unix timestamp to a calendar date, shifted by a fixed
/// number of hours.
///
/// The offset exists for deployments whose business day is anchored to a
/// local timezone rather than UTC; it defaults to zero. Out-of-range
/// timestamps fall back to today rather than failing the whole flow.
pub fn calendar_date(unix_ts: i64, offset_hours: i64) -> NaiveDate {
    let shifted = unix_ts.saturating_add(offset_hours.saturating_mul(3600));
    DateTime::<Utc>::from_timestamp(shifted, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_else(|| Utc::now().date_naive())
}

/// Render a timestamp as `D/M/YYYY` with no zero padding, e.g. `24/8/2023`.
pub fn date_string(unix_ts: i64, offset_hours: i64) -> String {
    let date = calendar_date(unix_ts, offset_hours);
    format!("{}/{}/{}", date.day(), date.month(), date.year())
}

fn expired_as_of(exp_month: u32, exp_year: i32, ref_month: u32, ref_year: i32) -> bool {
    exp_year < ref_year || (exp_year == ref_year && exp_month <= ref_month)
}

/// Whether a card expiry of `exp_month`/`exp_year` is unusable on the given
/// date. Expiry in the current month counts as expired.
pub fn is_expired(exp_month: u32, exp_year: i32, on: NaiveDate) -> bool {
    expired_as_of(exp_month, exp_year, on.month(), on.year())
}

/// Whether the card is expired now or will be one calendar month from `on`.
///
/// Always true for already-expired cards, so callers can treat "soon" as
/// the broader condition and "expired" as the stricter one.
pub fn is_expiring_soon(exp_month: u32, exp_year: i32, on: NaiveDate) -> bool {
    if is_expired(exp_month, exp_year, on) {
        return true;
    }
    let (next_month, next_year) = if on.month() == 12 {
        (1, on.year() + 1)
    } else {
        (on.month() + 1, on.year())
    };
    expired_as_of(exp_month, exp_year, next_month, next_year)
}
