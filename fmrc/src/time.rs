//! Conversions between calendar dates and fractional hour offsets.
//!
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Number of hours from `origin` to `date`, negative if `date` is earlier.
///
pub fn hours_between(origin: &DateTime<Utc>, date: &DateTime<Utc>) -> f64 {
    (*date - *origin).num_milliseconds() as f64 / MILLIS_PER_HOUR
}

/// The date `hours` after `origin`, rounded to the millisecond.
///
pub fn add_hours(origin: &DateTime<Utc>, hours: f64) -> DateTime<Utc> {
    *origin + Duration::milliseconds((hours * MILLIS_PER_HOUR).round() as i64)
}

pub fn to_iso(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an ISO 8601 date. Dates without a zone are taken to be UTC.
///
pub fn parse_iso(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(date) = NaiveDateTime::parse_from_str(text, format) {
            return Some(date.and_utc());
        }
    }

    None
}

/// Units string for a coordinate measured in hours since `origin`.
///
pub fn hours_since(origin: &DateTime<Utc>) -> String {
    format!("hours since {}", to_iso(origin))
}
