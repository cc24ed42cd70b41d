use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SchedulerError};

/// Longest accepted RUNNER interval.
pub const MAX_RUNNER_INTERVAL_SECS: f64 = 100.0 * 366.0 * 86_400.0;

/// Expand a 5-field Unix cron expression to the 6/7-field form the `cron`
/// crate parses (leading seconds field). Longer expressions pass through.
fn normalise_cron(expression: &str) -> String {
    match expression.split_whitespace().count() {
        5 => format!("0 {}", expression.trim()),
        _ => expression.trim().to_string(),
    }
}

/// Parse a cron expression, accepting 5, 6 or 7 fields.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalise_cron(expression))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))
}

/// First occurrence of `schedule` strictly after `after` (UTC).
///
/// `None` when the expression has no further occurrences (e.g. a year field
/// in the past).
pub fn next_cron_after(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// First slot of `anchor + k * interval` (k ≥ 0) strictly after `after`.
///
/// Returns `anchor` itself when it is still in the future, `None` when the
/// slot falls outside the representable date range.
pub fn next_interval_slot(
    anchor: DateTime<Utc>,
    interval: Duration,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if interval <= Duration::zero() {
        return None;
    }
    if anchor > after {
        return Some(anchor);
    }
    let behind = (after - anchor).num_milliseconds();
    let step = interval.num_milliseconds().max(1);
    let skipped = behind / step + 1;
    let offset = skipped.checked_mul(step)?;
    anchor.checked_add_signed(Duration::try_milliseconds(offset)?)
}

/// Convert a RUNNER interval in seconds to a `Duration`, rejecting
/// non-positive, non-finite or absurdly long values.
pub fn interval_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "runner interval must be positive, got {secs}"
        )));
    }
    if secs > MAX_RUNNER_INTERVAL_SECS {
        return Err(SchedulerError::InvalidSchedule(format!(
            "runner interval of {secs}s is longer than a century"
        )));
    }
    Ok(Duration::milliseconds((secs * 1000.0).round().max(1.0) as i64))
}
