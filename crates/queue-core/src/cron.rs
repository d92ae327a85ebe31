//! Cron expression parsing and next-occurrence computation.
//!
//! Five-field standard cron (`* * * * *`, ranges, steps, lists) evaluated
//! in an IANA timezone. Built on the `cron` crate, which parses a 7-field
//! (seconds-first, optional year) expression; a 5-field expression is
//! normalized by prepending a literal `0` seconds field, so the public
//! surface here stays standard 5-field cron while reusing a maintained
//! scheduling crate rather than hand-rolling one.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::CronError;

/// Normalize a 5-field expression to the 7-field form `cron` expects.
/// Expressions that already carry 6 or 7 fields pass through unchanged,
/// so callers that already speak the crate's native format are not broken.
fn normalize(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

fn parse_schedule(expr: &str) -> Result<Schedule, CronError> {
    Schedule::from_str(&normalize(expr))
        .map_err(|e| CronError::InvalidExpression(format!("{expr}: {e}")))
}

fn parse_timezone(tz: &str) -> Result<Tz, CronError> {
    tz.parse::<Tz>()
        .map_err(|_| CronError::UnknownTimezone(tz.to_string()))
}

/// Returns the next absolute UTC instant strictly after `after`, evaluated
/// in IANA timezone `tz` (empty string or `"UTC"` both mean UTC). Returns
/// `Ok(None)` when no future occurrence exists (e.g. Feb 30 forever).
pub fn get_next_occurrence(
    expr: &str,
    tz: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    let schedule = parse_schedule(expr)?;
    let tz = if tz.is_empty() { "UTC" } else { tz };
    let zone = parse_timezone(tz)?;

    let after_in_zone = after.with_timezone(&zone);
    let next = schedule
        .after(&after_in_zone)
        .next()
        .map(|dt| dt.with_timezone(&Utc));
    Ok(next)
}

/// Returns `true` iff `expr` is a syntactically valid 5/6/7-field cron
/// expression `cron` can parse.
pub fn validate(expr: &str) -> bool {
    parse_schedule(expr).is_ok()
}

/// Returns `true` iff `tz` is a recognized IANA timezone name.
pub fn validate_timezone(tz: &str) -> bool {
    let tz = if tz.is_empty() { "UTC" } else { tz };
    parse_timezone(tz).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn next_occurrence_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2026, 1, 15, 10, 2, 0).unwrap();
        let next = get_next_occurrence("*/5 * * * *", "UTC", after)
            .unwrap()
            .unwrap();
        assert!(next > after);
        assert_eq!(next.minute(), 5);
    }

    use chrono::Timelike;

    #[test]
    fn tokyo_daily_schedule() {
        // schedule "0 20 * * *" in Asia/Tokyo after 2026-01-15T10:02:00Z
        // yields 2026-01-15T11:00:00Z (20:00 JST == 11:00 UTC).
        let after = Utc.with_ymd_and_hms(2026, 1, 15, 10, 2, 0).unwrap();
        let next = get_next_occurrence("0 20 * * *", "Asia/Tokyo", after)
            .unwrap()
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 15, 11, 0, 0).unwrap();
        assert_eq!(next, expected);
    }

    #[test]
    fn invalid_expression_rejected() {
        assert!(!validate("not a cron expression"));
    }

    #[test]
    fn valid_expression_accepted() {
        assert!(validate("*/15 * * * *"));
        assert!(validate("0 9 * * 1-5"));
    }

    #[test]
    fn unknown_timezone_errors() {
        let after = Utc::now();
        let result = get_next_occurrence("* * * * *", "Not/AZone", after);
        assert!(matches!(result, Err(CronError::UnknownTimezone(_))));
    }
}
