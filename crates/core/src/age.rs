//! Age predicate over record creation timestamps.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};

use crate::CoreError;

const NANOS_PER_HOUR: f64 = 3_600_000_000_000.0;
const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Elapsed hours between `created` and `now` (negative for future timestamps).
/// Nanosecond precision; spans too long for an `i64` of nanoseconds fall back
/// to milliseconds.
pub fn age_hours(created: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age = now - created;
    match age.num_nanoseconds() {
        Some(ns) => ns as f64 / NANOS_PER_HOUR,
        None => age.num_milliseconds() as f64 / MILLIS_PER_HOUR,
    }
}

/// Rejects thresholds that cannot describe an age.
pub fn validate_min_age(min_age_hours: f64) -> Result<(), CoreError> {
    if !min_age_hours.is_finite() || min_age_hours < 0.0 {
        return Err(CoreError::InvalidCriteria(format!(
            "minAge must be a non-negative number of hours, got {}",
            min_age_hours
        )));
    }
    Ok(())
}

/// True when a record created at `created` is strictly older than
/// `min_age_hours` at `now`.
///
/// A threshold of zero disables the check: every record passes and the
/// timestamp is not looked at. A record without a creation time never
/// passes a positive threshold.
pub fn older_than(
    created: Option<DateTime<Utc>>,
    min_age_hours: f64,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    validate_min_age(min_age_hours)?;
    if min_age_hours == 0.0 {
        return Ok(true);
    }
    Ok(created.is_some_and(|ts| age_hours(ts, now) > min_age_hours))
}
