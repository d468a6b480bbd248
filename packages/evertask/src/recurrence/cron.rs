//! Cron expression parsing and evaluation, in UTC.
//!
//! Accepts 5-field (minute granularity) or 6-field (leading seconds)
//! expressions. The underlying parser always takes a seconds field, so
//! 5-field expressions are normalised by prepending `0`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::TaskError;

/// Parse a 5- or 6-field cron expression. Any other field count is rejected.
pub(crate) fn parse_schedule(expression: &str) -> Result<Schedule, TaskError> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {trimmed}"),
        6 => trimmed.to_string(),
        other => {
            return Err(TaskError::invalid_spec(format!(
                "cron expression must have 5 or 6 fields, got {other}: {expression:?}"
            )))
        }
    };

    Schedule::from_str(&normalized).map_err(|e| {
        TaskError::invalid_spec(format!("malformed cron expression {expression:?}: {e}"))
    })
}

/// The next occurrence strictly after `after`, in UTC.
pub(crate) fn next_occurrence(
    schedule: &Schedule,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    #[test]
    fn five_field_expression_parses() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = next_occurrence(&schedule, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expression_keeps_seconds() {
        let schedule = parse_schedule("30 * * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = next_occurrence(&schedule, after).unwrap();
        assert_eq!(next.second(), 30);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap());
    }

    #[test]
    fn four_field_expression_is_rejected() {
        let err = parse_schedule("* * * *").unwrap_err();
        assert!(matches!(err, TaskError::InvalidSpec { .. }));
    }

    #[test]
    fn seven_field_expression_is_rejected() {
        let err = parse_schedule("0 0 * * * * 2024").unwrap_err();
        assert!(matches!(err, TaskError::InvalidSpec { .. }));
    }

    #[test]
    fn garbage_expression_is_rejected() {
        let err = parse_schedule("not a cron at all").unwrap_err();
        assert!(matches!(err, TaskError::InvalidSpec { .. }));
    }

    #[test]
    fn occurrences_are_strictly_after() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let exactly_on = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();
        let next = next_occurrence(&schedule, exactly_on).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 10, 0).unwrap());
    }
}
