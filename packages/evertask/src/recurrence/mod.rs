//! Recurring schedule model and evaluation.
//!
//! A [`RecurrenceSpec`] is a plain value: at most one [`Cadence`], an
//! optional [`InitialTrigger`] for the first run, and optional terminators
//! (`max_runs`, `run_until`). The spec serialises to self-describing JSON so
//! it can be persisted with the task and rebuilt on recovery.
//!
//! Evaluation contract:
//! - [`RecurrenceSpec::next_run`] computes the next UTC instant for a given
//!   run index, or nothing once the series has terminated.
//! - [`RecurrenceSpec::calculate_next_valid_run`] reconciles a stale
//!   schedule after downtime, reporting the occurrences that were missed.

mod cron;

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{
    DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Window within which a first-run trigger is honoured as-is.
const FIRST_RUN_WINDOW: Duration = Duration::seconds(1);
/// A first run this close before the cadence instant is folded into it.
const NEAR_FIRE_GAP: Duration = Duration::seconds(30);
/// How stale a naive next run must be before downtime reconciliation kicks in.
const PAST_TOLERANCE: Duration = Duration::seconds(1);
/// Most skipped instants listed individually; the count is always exact.
const SKIP_LIST_CAP: usize = 1000;
/// Bail-out for iterative skip counting on irregular cadences.
const SKIP_ITER_CAP: u64 = 10_000;

// ============================================================================
// Value model
// ============================================================================

/// How the first run of a series is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialTrigger {
    /// Fire immediately on dispatch.
    RunNow,
    /// Fire after a fixed delay from dispatch.
    Delayed { delay: StdDuration },
    /// Fire at a specific instant.
    At { instant: DateTime<Utc> },
}

impl InitialTrigger {
    fn first_instant(&self, current: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            InitialTrigger::RunNow => current,
            InitialTrigger::Delayed { delay } => Duration::from_std(*delay)
                .ok()
                .and_then(|d| current.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            InitialTrigger::At { instant } => *instant,
        }
    }
}

/// Day-of-month selection for a monthly cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthDaySelector {
    /// A single day, clamped to the last valid day of shorter months.
    OnDay(u32),
    /// Several days, each clamped the same way.
    OnDays(Vec<u32>),
    /// The first occurrence of a weekday in the month.
    OnFirst(Weekday),
}

/// The repeating cadence of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum Cadence {
    /// 5- or 6-field cron expression, evaluated in UTC.
    Cron { expression: String },
    Seconds {
        every: u32,
    },
    Minutes {
        every: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_second: Option<u32>,
    },
    Hours {
        every: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_minute: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_second: Option<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_hours: Vec<u32>,
    },
    Days {
        every: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_times: Vec<NaiveTime>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_days: Vec<Weekday>,
    },
    Weeks {
        every: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_days: Vec<Weekday>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_times: Vec<NaiveTime>,
    },
    Months {
        every: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day: Option<MonthDaySelector>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_times: Vec<NaiveTime>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_months: Vec<u32>,
    },
}

/// A complete recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RecurrenceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<InitialTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Cadence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_until: Option<DateTime<Utc>>,
}

/// Result of downtime reconciliation.
#[derive(Debug, Clone)]
pub struct NextValidRun {
    /// First valid instant strictly in the future, if the series continues.
    pub next: Option<DateTime<Utc>>,
    /// Missed instants, listed up to a cap.
    pub skipped: Vec<DateTime<Utc>>,
    /// Exact number of missed occurrences.
    pub skipped_count: u64,
}

impl NextValidRun {
    fn current(next: Option<DateTime<Utc>>) -> Self {
        Self {
            next,
            skipped: Vec::new(),
            skipped_count: 0,
        }
    }
}

// ============================================================================
// Construction helpers
// ============================================================================

impl RecurrenceSpec {
    /// Fire once immediately; combine with a cadence for "now, then every N".
    pub fn run_now() -> Self {
        Self {
            initial: Some(InitialTrigger::RunNow),
            ..Default::default()
        }
    }

    pub fn starting_in(delay: StdDuration) -> Self {
        Self {
            initial: Some(InitialTrigger::Delayed { delay }),
            ..Default::default()
        }
    }

    pub fn starting_at(instant: DateTime<Utc>) -> Self {
        Self {
            initial: Some(InitialTrigger::At { instant }),
            ..Default::default()
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cadence: Some(Cadence::Cron {
                expression: expression.into(),
            }),
            ..Default::default()
        }
    }

    pub fn every_seconds(every: u32) -> Self {
        Self::default().with_cadence(Cadence::Seconds { every })
    }

    pub fn every_minutes(every: u32) -> Self {
        Self::default().with_cadence(Cadence::Minutes {
            every,
            on_second: None,
        })
    }

    pub fn every_hours(every: u32) -> Self {
        Self::default().with_cadence(Cadence::Hours {
            every,
            on_minute: None,
            on_second: None,
            on_hours: Vec::new(),
        })
    }

    pub fn every_days(every: u32) -> Self {
        Self::default().with_cadence(Cadence::Days {
            every,
            on_times: Vec::new(),
            on_days: Vec::new(),
        })
    }

    pub fn every_weeks(every: u32) -> Self {
        Self::default().with_cadence(Cadence::Weeks {
            every,
            on_days: Vec::new(),
            on_times: Vec::new(),
        })
    }

    pub fn every_months(every: u32) -> Self {
        Self::default().with_cadence(Cadence::Months {
            every,
            day: None,
            on_times: Vec::new(),
            on_months: Vec::new(),
        })
    }

    pub fn with_initial(mut self, initial: InitialTrigger) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = Some(cadence);
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn until(mut self, run_until: DateTime<Utc>) -> Self {
        self.run_until = Some(run_until);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl Cadence {
    fn validate(&self) -> Result<(), TaskError> {
        match self {
            Cadence::Cron { expression } => {
                cron::parse_schedule(expression)?;
                Ok(())
            }
            Cadence::Seconds { every } => {
                if *every == 0 {
                    return Err(TaskError::invalid_spec("second interval cannot be zero"));
                }
                Ok(())
            }
            Cadence::Minutes { every, on_second } => {
                if *every == 0 {
                    return Err(TaskError::invalid_spec("minute interval cannot be zero"));
                }
                check_range("second", on_second.iter().copied(), 0, 59)
            }
            Cadence::Hours {
                every,
                on_minute,
                on_second,
                on_hours,
            } => {
                if *every == 0 && on_hours.is_empty() {
                    return Err(TaskError::invalid_spec(
                        "hour interval cannot be zero without specific hours",
                    ));
                }
                check_range("hour", on_hours.iter().copied(), 0, 23)?;
                check_range("minute", on_minute.iter().copied(), 0, 59)?;
                check_range("second", on_second.iter().copied(), 0, 59)
            }
            Cadence::Days {
                every,
                on_times,
                on_days,
            } => {
                if *every == 0 && on_times.is_empty() && on_days.is_empty() {
                    return Err(TaskError::invalid_spec(
                        "day interval cannot be zero without times or days",
                    ));
                }
                Ok(())
            }
            Cadence::Weeks { every, on_days, .. } => {
                if *every == 0 && on_days.is_empty() {
                    return Err(TaskError::invalid_spec(
                        "week interval cannot be zero without days",
                    ));
                }
                Ok(())
            }
            Cadence::Months {
                every,
                day,
                on_months,
                ..
            } => {
                if *every == 0 && on_months.is_empty() {
                    return Err(TaskError::invalid_spec(
                        "month interval cannot be zero without months",
                    ));
                }
                match day {
                    Some(MonthDaySelector::OnDay(d)) => {
                        check_range("day of month", std::iter::once(*d), 1, 31)?
                    }
                    Some(MonthDaySelector::OnDays(ds)) => {
                        if ds.is_empty() {
                            return Err(TaskError::invalid_spec("day list cannot be empty"));
                        }
                        check_range("day of month", ds.iter().copied(), 1, 31)?
                    }
                    Some(MonthDaySelector::OnFirst(_)) | None => {}
                }
                check_range("month", on_months.iter().copied(), 1, 12)
            }
        }
    }
}

fn check_range(
    what: &str,
    values: impl IntoIterator<Item = u32>,
    min: u32,
    max: u32,
) -> Result<(), TaskError> {
    for value in values {
        if value < min || value > max {
            return Err(TaskError::invalid_spec(format!(
                "{what} {value} is outside {min}..={max}"
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Cadence evaluation
// ============================================================================

impl Cadence {
    /// Next occurrence strictly after `after`. The cadence must be valid.
    fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, TaskError> {
        match self {
            Cadence::Cron { expression } => {
                let schedule = cron::parse_schedule(expression)?;
                cron::next_occurrence(&schedule, after).ok_or_else(|| {
                    TaskError::invalid_spec(format!(
                        "cron expression {expression:?} has no future occurrence"
                    ))
                })
            }
            Cadence::Seconds { every } => Ok(after + Duration::seconds(i64::from(*every))),
            Cadence::Minutes { every, on_second } => {
                let base = after + Duration::minutes(i64::from(*every));
                Ok(apply_second(base, *on_second))
            }
            Cadence::Hours {
                every,
                on_minute,
                on_second,
                on_hours,
            } => next_hourly(after, *every, *on_minute, *on_second, on_hours),
            Cadence::Days {
                every,
                on_times,
                on_days,
            } => next_daily(after, *every, on_times, on_days),
            Cadence::Weeks {
                every,
                on_days,
                on_times,
            } => next_weekly(after, *every, on_days, on_times),
            Cadence::Months {
                every,
                day,
                on_times,
                on_months,
            } => next_monthly(after, *every, day.as_ref(), on_times, on_months),
        }
    }

    /// Fixed period for O(1) downtime skip, when the cadence is uniform.
    fn fixed_period(&self) -> Option<Duration> {
        match self {
            Cadence::Seconds { every } => Some(Duration::seconds(i64::from(*every))),
            Cadence::Minutes { every, .. } => Some(Duration::minutes(i64::from(*every))),
            Cadence::Hours { every, on_hours, .. } if on_hours.is_empty() => {
                Some(Duration::hours(i64::from(*every)))
            }
            Cadence::Days {
                every,
                on_times,
                on_days,
            } if on_days.is_empty() && on_times.len() <= 1 && *every > 0 => {
                Some(Duration::days(i64::from(*every)))
            }
            Cadence::Weeks {
                every,
                on_days,
                on_times,
            } if on_days.is_empty() && on_times.len() <= 1 => {
                Some(Duration::weeks(i64::from(*every)))
            }
            _ => None,
        }
    }
}

fn utc_at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn apply_second(instant: DateTime<Utc>, on_second: Option<u32>) -> DateTime<Utc> {
    match on_second {
        Some(second) => instant
            .with_nanosecond(0)
            .and_then(|i| i.with_second(second))
            .unwrap_or(instant),
        None => instant,
    }
}

fn next_hourly(
    after: DateTime<Utc>,
    every: u32,
    on_minute: Option<u32>,
    on_second: Option<u32>,
    on_hours: &[u32],
) -> Result<DateTime<Utc>, TaskError> {
    let mut base = after + Duration::hours(i64::from(every));
    for _ in 0..=48 {
        if !on_hours.is_empty() && !on_hours.contains(&base.hour()) {
            base += Duration::hours(1);
            continue;
        }
        let mut candidate = base;
        if let Some(minute) = on_minute {
            candidate = candidate
                .with_nanosecond(0)
                .and_then(|c| c.with_second(0))
                .and_then(|c| c.with_minute(minute))
                .unwrap_or(candidate);
        }
        candidate = apply_second(candidate, on_second);
        if candidate > after {
            return Ok(candidate);
        }
        base += Duration::hours(1);
    }
    Err(TaskError::invalid_spec(
        "hour cadence produced no occurrence within two days",
    ))
}

fn day_allowed(weekday: Weekday, on_days: &[Weekday]) -> bool {
    on_days.is_empty() || on_days.contains(&weekday)
}

/// Smallest listed time on `date` strictly after `after`; when no times are
/// listed, `after`'s own time-of-day is reused.
fn pick_time_on(
    date: NaiveDate,
    on_times: &[NaiveTime],
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if on_times.is_empty() {
        let candidate = utc_at(date, after.time());
        return (candidate > after).then_some(candidate);
    }
    let mut times = on_times.to_vec();
    times.sort();
    times
        .into_iter()
        .map(|t| utc_at(date, t))
        .find(|candidate| *candidate > after)
}

fn next_daily(
    after: DateTime<Utc>,
    every: u32,
    on_times: &[NaiveTime],
    on_days: &[Weekday],
) -> Result<DateTime<Utc>, TaskError> {
    let today = after.date_naive();

    // Same-day shortcut: the smallest listed time still ahead of the clock.
    if !on_times.is_empty() && day_allowed(today.weekday(), on_days) {
        if let Some(candidate) = pick_time_on(today, on_times, after) {
            return Ok(candidate);
        }
    }

    let step = u64::from(every.max(1));
    let mut date = today
        .checked_add_days(Days::new(step))
        .ok_or_else(|| TaskError::invalid_spec("day cadence overflowed the calendar"))?;
    for _ in 0..=366 {
        if day_allowed(date.weekday(), on_days) {
            if let Some(candidate) = pick_time_on(date, on_times, after) {
                return Ok(candidate);
            }
        }
        date = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| TaskError::invalid_spec("day cadence overflowed the calendar"))?;
    }
    Err(TaskError::invalid_spec(
        "day cadence produced no occurrence within a year",
    ))
}

fn next_weekly(
    after: DateTime<Utc>,
    every: u32,
    on_days: &[Weekday],
    on_times: &[NaiveTime],
) -> Result<DateTime<Utc>, TaskError> {
    let today = after.date_naive();

    if on_days.is_empty() {
        // Pure interval: keep the weekday, shift whole weeks.
        let mut candidate = after + Duration::weeks(i64::from(every.max(1)));
        if let Some(time) = on_times.iter().min() {
            candidate = utc_at(candidate.date_naive(), *time);
            if candidate <= after {
                candidate += Duration::weeks(i64::from(every.max(1)));
            }
        }
        return Ok(candidate);
    }

    // Remaining listed days of the current week first.
    let days_from_monday = u64::from(today.weekday().num_days_from_monday());
    for offset in 0..(7 - days_from_monday) {
        let date = today + Days::new(offset);
        if on_days.contains(&date.weekday()) {
            if let Some(candidate) = pick_time_on(date, on_times, after) {
                return Ok(candidate);
            }
        }
    }

    // Then the first listed day `every` weeks ahead of this week's Monday.
    let monday = today - Days::new(days_from_monday);
    let target_week = monday + Days::new(7 * u64::from(every.max(1)));
    for offset in 0..7 {
        let date = target_week + Days::new(offset);
        if on_days.contains(&date.weekday()) {
            let time = on_times.iter().min().copied().unwrap_or_else(|| after.time());
            return Ok(utc_at(date, time));
        }
    }
    Err(TaskError::invalid_spec(
        "week cadence produced no occurrence",
    ))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn first_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let offset = (weekday.num_days_from_monday() + 7 - first.weekday().num_days_from_monday()) % 7;
    1 + offset
}

fn next_monthly(
    after: DateTime<Utc>,
    every: u32,
    day: Option<&MonthDaySelector>,
    on_times: &[NaiveTime],
    on_months: &[u32],
) -> Result<DateTime<Utc>, TaskError> {
    let mut cursor = after
        .checked_add_months(Months::new(every))
        .ok_or_else(|| TaskError::invalid_spec("month cadence overflowed the calendar"))?;

    for _ in 0..=48 {
        let (year, month) = (cursor.year(), cursor.month());
        if on_months.is_empty() || on_months.contains(&month) {
            let last_day = days_in_month(year, month);
            // OnDay past the end of a short month lands on its last valid day.
            let mut candidate_days: Vec<u32> = match day {
                None => vec![after.day().min(last_day)],
                Some(MonthDaySelector::OnDay(d)) => vec![(*d).min(last_day)],
                Some(MonthDaySelector::OnDays(ds)) => {
                    let mut clamped: Vec<u32> = ds.iter().map(|d| (*d).min(last_day)).collect();
                    clamped.sort_unstable();
                    clamped.dedup();
                    clamped
                }
                Some(MonthDaySelector::OnFirst(weekday)) => {
                    vec![first_weekday_of_month(year, month, *weekday)]
                }
            };
            candidate_days.sort_unstable();

            for d in candidate_days {
                let date = NaiveDate::from_ymd_opt(year, month, d)
                    .ok_or_else(|| TaskError::invalid_spec("month cadence produced bad date"))?;
                if let Some(candidate) = pick_time_on(date, on_times, after) {
                    return Ok(candidate);
                }
            }
        }
        cursor = cursor
            .checked_add_months(Months::new(1))
            .ok_or_else(|| TaskError::invalid_spec("month cadence overflowed the calendar"))?;
    }
    Err(TaskError::invalid_spec(
        "month cadence produced no occurrence within four years",
    ))
}

// ============================================================================
// Engine
// ============================================================================

impl RecurrenceSpec {
    /// Check internal consistency without evaluating anything.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.initial.is_none() && self.cadence.is_none() {
            return Err(TaskError::invalid_spec(
                "recurrence needs an initial trigger or a cadence",
            ));
        }
        if let Some(cadence) = &self.cadence {
            cadence.validate()?;
        }
        if self.max_runs == Some(0) {
            return Err(TaskError::invalid_spec("max runs cannot be zero"));
        }
        Ok(())
    }

    fn guard(&self, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.run_until {
            Some(until) if candidate >= until => None,
            _ => Some(candidate),
        }
    }

    /// Next instant for the run with 0-based index `run_index`, or nothing
    /// once `max_runs` is reached, the candidate falls past `run_until`, or
    /// the spec has no cadence left to apply.
    pub fn next_run(
        &self,
        current: DateTime<Utc>,
        run_index: u32,
    ) -> Result<Option<DateTime<Utc>>, TaskError> {
        self.validate()?;

        if let Some(max) = self.max_runs {
            if run_index >= max {
                return Ok(None);
            }
        }

        if run_index == 0 {
            if let Some(initial) = &self.initial {
                let first = initial.first_instant(current);
                if first <= current + FIRST_RUN_WINDOW {
                    if let Some(cadence) = &self.cadence {
                        let next = cadence.next_after(current)?;
                        // A first run just before the cadence instant would
                        // double-fire; fold it into the cadence instant.
                        if next >= first && next - first <= NEAR_FIRE_GAP {
                            return Ok(self.guard(next));
                        }
                    }
                    return Ok(self.guard(first));
                }
                // First-run instant outside the window: cadence decides.
            }
        }

        match &self.cadence {
            Some(cadence) => {
                let next = cadence.next_after(current)?;
                Ok(self.guard(next))
            }
            None => Ok(None),
        }
    }

    /// Reconcile a possibly stale schedule against `reference_now`.
    ///
    /// When the naive next run is more than a second in the past, whole
    /// cadence periods are skipped to reach the first instant after now;
    /// skipped occurrences count against `max_runs`.
    pub fn calculate_next_valid_run(
        &self,
        scheduled: DateTime<Utc>,
        run_index: u32,
        reference_now: DateTime<Utc>,
    ) -> Result<NextValidRun, TaskError> {
        let Some(naive_next) = self.next_run(scheduled, run_index)? else {
            return Ok(NextValidRun::current(None));
        };

        if naive_next >= reference_now - PAST_TOLERANCE {
            return Ok(NextValidRun::current(Some(naive_next)));
        }

        let Some(cadence) = &self.cadence else {
            // A stale one-shot initial trigger: the single occurrence is gone.
            return Ok(NextValidRun {
                next: None,
                skipped: vec![naive_next],
                skipped_count: 1,
            });
        };

        let (skipped, skipped_count, candidate) = match cadence.fixed_period() {
            Some(period) => {
                let period_ms = period.num_milliseconds().max(1);
                let gap_ms = (reference_now - naive_next).num_milliseconds();
                let mut count = (gap_ms + period_ms - 1) / period_ms;
                let mut candidate = naive_next + Duration::milliseconds(period_ms * count);
                if candidate <= reference_now {
                    candidate += period;
                    count += 1;
                }
                let count = count as u64;
                let listed = count.min(SKIP_LIST_CAP as u64);
                let skipped: Vec<DateTime<Utc>> = (0..listed as i64)
                    .map(|i| naive_next + Duration::milliseconds(period_ms * i))
                    .collect();
                (skipped, count, candidate)
            }
            None => {
                let mut skipped = Vec::new();
                let mut count = 0u64;
                let mut cursor = naive_next;
                while cursor <= reference_now {
                    count += 1;
                    if skipped.len() < SKIP_LIST_CAP {
                        skipped.push(cursor);
                    }
                    if count >= SKIP_ITER_CAP {
                        tracing::warn!(
                            skipped = count,
                            "skip reconciliation hit iteration cap, jumping to next occurrence"
                        );
                        cursor = cadence.next_after(reference_now)?;
                        break;
                    }
                    cursor = cadence.next_after(cursor)?;
                }
                (skipped, count, cursor)
            }
        };

        // Skipped occurrences consume the run budget.
        if let Some(max) = self.max_runs {
            let remaining = u64::from(max.saturating_sub(run_index));
            if skipped_count >= remaining {
                let mut truncated = skipped;
                truncated.truncate(remaining as usize);
                return Ok(NextValidRun {
                    next: None,
                    skipped: truncated,
                    skipped_count: remaining,
                });
            }
        }

        Ok(NextValidRun {
            next: self.guard(candidate),
            skipped,
            skipped_count,
        })
    }
}

// ============================================================================
// Human-readable summary
// ============================================================================

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Cron { expression } => write!(f, "cron {expression}"),
            Cadence::Seconds { every } => write!(f, "every {every} second(s)"),
            Cadence::Minutes { every, .. } => write!(f, "every {every} minute(s)"),
            Cadence::Hours { every, on_hours, .. } => {
                if on_hours.is_empty() {
                    write!(f, "every {every} hour(s)")
                } else {
                    write!(f, "every {every} hour(s) on hours {on_hours:?}")
                }
            }
            Cadence::Days {
                every,
                on_times,
                on_days,
            } => {
                write!(f, "every {every} day(s)")?;
                if !on_days.is_empty() {
                    write!(f, " on {on_days:?}")?;
                }
                if !on_times.is_empty() {
                    write!(f, " at {on_times:?}")?;
                }
                Ok(())
            }
            Cadence::Weeks {
                every,
                on_days,
                on_times,
            } => {
                write!(f, "every {every} week(s)")?;
                if !on_days.is_empty() {
                    write!(f, " on {on_days:?}")?;
                }
                if !on_times.is_empty() {
                    write!(f, " at {on_times:?}")?;
                }
                Ok(())
            }
            Cadence::Months { every, day, .. } => {
                write!(f, "every {every} month(s)")?;
                match day {
                    Some(MonthDaySelector::OnDay(d)) => write!(f, " on day {d}")?,
                    Some(MonthDaySelector::OnDays(ds)) => write!(f, " on days {ds:?}")?,
                    Some(MonthDaySelector::OnFirst(wd)) => write!(f, " on first {wd}")?,
                    None => {}
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for RecurrenceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(initial) = &self.initial {
            match initial {
                InitialTrigger::RunNow => write!(f, "runs now")?,
                InitialTrigger::Delayed { delay } => write!(f, "starts after {delay:?}")?,
                InitialTrigger::At { instant } => write!(f, "starts at {instant}")?,
            }
            wrote = true;
        }
        if let Some(cadence) = &self.cadence {
            if wrote {
                write!(f, ", then ")?;
            }
            write!(f, "{cadence}")?;
            wrote = true;
        }
        if let Some(max) = self.max_runs {
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "at most {max} run(s)")?;
            wrote = true;
        }
        if let Some(until) = self.run_until {
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "until {until}")?;
        }
        Ok(())
    }
}
