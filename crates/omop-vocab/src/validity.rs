//! Validity date computation.

use chrono::{Datelike, NaiveDate};

/// Returns the date a concept must be valid on for a coded event.
///
/// A four-digit version year that differs from the event's year means the
/// code was assigned from that year's catalogue; the last day of that year
/// is used. Otherwise the event date itself is used. Without an event date
/// there is no temporal filter and `None` is returned.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use omop_vocab::validity_date;
///
/// let event = NaiveDate::from_ymd_opt(2020, 6, 1).unwrap();
/// assert_eq!(
///     validity_date(Some("2019"), Some(event)),
///     NaiveDate::from_ymd_opt(2019, 12, 31)
/// );
/// assert_eq!(validity_date(None, Some(event)), Some(event));
/// assert_eq!(validity_date(Some("2019"), None), None);
/// ```
pub fn validity_date(version: Option<&str>, event_date: Option<NaiveDate>) -> Option<NaiveDate> {
    let event_date = event_date?;
    match version.and_then(version_year) {
        Some(year) if year != event_date.year() => NaiveDate::from_ymd_opt(year, 12, 31),
        _ => Some(event_date),
    }
}

/// Extracts a leading four-digit year (`2019`, `2019-01`, `2019.1`).
fn version_year(version: &str) -> Option<i32> {
    let version = version.trim();
    let digits = version.get(..4)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if version[4..].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
