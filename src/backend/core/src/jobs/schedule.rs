//! Schedules: fixed intervals, five-field cron expressions, and run-once.
//!
//! A [`ScheduleSpec`] is the raw value taken from configuration. It is turned
//! into a [`Schedule`] exactly once, by [`ScheduleSpec::parse`], and only a
//! parsed `Schedule` can be attached to a job. Evaluating a schedule that was
//! never validated is therefore not expressible.
//!
//! ```rust
//! use keel_core::jobs::ScheduleSpec;
//! use std::time::Duration;
//!
//! assert!(ScheduleSpec::fixed_interval(Duration::from_millis(500)).parse().is_err());
//! assert!(ScheduleSpec::cron("*/5 * * * *").parse().is_ok());
//! assert!(ScheduleSpec::cron("not a cron").parse().is_err());
//! ```

use chrono::{DateTime, DurationRound, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while parsing a schedule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cron ticker interval {0:?} must be positive and at least one second")]
    IntervalTooShort(Duration),

    #[error("invalid cron string {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },
}

impl ScheduleError {
    fn invalid_cron(expression: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidCron {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Unparsed schedule, as requested by configuration or code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    /// Fire every `d`, on a whole-second grid.
    FixedInterval(Duration),
    /// Standard five-field cron expression or an `@` macro.
    CronExpression(String),
    /// Fire once at startup, never again.
    RunOnce,
}

impl ScheduleSpec {
    pub fn fixed_interval(interval: Duration) -> Self {
        Self::FixedInterval(interval)
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::CronExpression(expression.into())
    }

    pub fn run_once() -> Self {
        Self::RunOnce
    }

    /// Validate the raw value and produce an evaluable schedule.
    pub fn parse(&self) -> Result<Schedule, ScheduleError> {
        match self {
            Self::FixedInterval(interval) => {
                if *interval < Duration::from_secs(1) {
                    return Err(ScheduleError::IntervalTooShort(*interval));
                }
                Ok(Schedule::every(*interval, format!("every {}", humantime::format_duration(*interval))))
            }
            Self::CronExpression(expression) => parse_cron(expression),
            Self::RunOnce => Ok(Schedule::once()),
        }
    }
}

/// A cron expression. When both day fields are restricted a day matching
/// either one fires, so each field gets its own schedule.
#[derive(Debug, Clone)]
struct CronRule {
    primary: cron::Schedule,
    either_day: Option<cron::Schedule>,
}

impl CronRule {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let primary = self.primary.after(&after).next();
        let other = self
            .either_day
            .as_ref()
            .and_then(|schedule| schedule.after(&after).next());
        match (primary, other) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    Every(chrono::Duration),
    Cron(Box<CronRule>),
    Once,
}

/// A validated schedule. Immutable, cheap to clone and reused for the process lifetime.
#[derive(Debug, Clone)]
pub struct Schedule {
    kind: ScheduleKind,
    description: String,
}

impl Schedule {
    fn every(interval: Duration, description: String) -> Self {
        let interval = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Self {
            kind: ScheduleKind::Every(interval),
            description,
        }
    }

    /// The run-once schedule. Always valid.
    pub fn once() -> Self {
        Self {
            kind: ScheduleKind::Once,
            description: "once".to_string(),
        }
    }

    /// Next fire time strictly after `after`; `None` means no further occurrences.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            ScheduleKind::Every(interval) => {
                let base = after
                    .duration_trunc(chrono::Duration::seconds(1))
                    .unwrap_or(after);
                base.checked_add_signed(*interval)
            }
            ScheduleKind::Cron(rule) => rule.next(after),
            ScheduleKind::Once => None,
        }
    }

    /// First fire time for a schedule started at `now`. Run-once fires immediately.
    pub fn first(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.kind {
            ScheduleKind::Once => Some(now),
            _ => self.next(now),
        }
    }

    pub fn is_run_once(&self) -> bool {
        matches!(self.kind, ScheduleKind::Once)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cron parsing
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expression.trim();

    if let Some(rest) = trimmed.strip_prefix("@every") {
        let interval = humantime::parse_duration(rest.trim())
            .map_err(|e| ScheduleError::invalid_cron(expression, e))?;
        // whole seconds, at least one
        let secs = std::cmp::max(interval.as_secs(), 1);
        return Ok(Schedule::every(Duration::from_secs(secs), trimmed.to_string()));
    }

    let mut either_day = None;
    let six_fields = match trimmed {
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@weekly" => "0 0 0 * * 1".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        other if other.starts_with('@') => {
            return Err(ScheduleError::invalid_cron(expression, "unrecognized descriptor"));
        }
        other => {
            let fields: Vec<&str> = other.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(ScheduleError::invalid_cron(
                    expression,
                    format!("expected exactly 5 fields, found {}", fields.len()),
                ));
            }
            let day_of_week = translate_day_of_week(fields[4])
                .map_err(|reason| ScheduleError::invalid_cron(expression, reason))?;
            if is_restricted(fields[2]) && is_restricted(fields[4]) {
                either_day = Some(format!(
                    "0 {} {} * {} {}",
                    fields[0], fields[1], fields[3], day_of_week
                ));
                format!("0 {} {} {} {} *", fields[0], fields[1], fields[2], fields[3])
            } else {
                format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], day_of_week
                )
            }
        }
    };

    let compile = |fields: &str| {
        cron::Schedule::from_str(fields).map_err(|e| ScheduleError::invalid_cron(expression, e))
    };
    let rule = CronRule {
        primary: compile(&six_fields)?,
        either_day: either_day.as_deref().map(compile).transpose()?,
    };

    Ok(Schedule {
        kind: ScheduleKind::Cron(Box::new(rule)),
        description: trimmed.to_string(),
    })
}

fn is_restricted(day_field: &str) -> bool {
    day_field != "*" && day_field != "?"
}

/// Rewrite a POSIX day-of-week field (0-7, Sunday = 0 or 7) into the `cron`
/// crate's numbering (1-7, Sunday = 1). Named days pass through untouched;
/// numeric ranges and steps are expanded into explicit lists.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut out = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step {:?}", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        if range.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(part.to_string());
            continue;
        }

        let (start, end) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((a, b))) => (parse_weekday(a)?, parse_weekday(b)?),
            (single, None) if step.is_some() => (parse_weekday(single)?, 6),
            (single, None) => {
                let day = parse_weekday(single)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day-of-week range {:?} is reversed", range));
        }

        let step = step.unwrap_or(1);
        let mut day = start;
        while day <= end {
            out.push((day % 7 + 1).to_string());
            day += step;
        }
    }

    Ok(out.join(","))
}

fn parse_weekday(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day-of-week value {:?} out of range 0-7", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_fixed_interval_lower_bound() {
        for millis in [0_u64, 1, 500, 999] {
            let err = ScheduleSpec::fixed_interval(Duration::from_millis(millis))
                .parse()
                .unwrap_err();
            assert!(err.to_string().contains("must be positive and at least one second"));
        }
        for millis in [1000_u64, 1001, 60_000] {
            assert!(ScheduleSpec::fixed_interval(Duration::from_millis(millis))
                .parse()
                .is_ok());
        }
    }

    #[test]
    fn test_fixed_interval_next_is_on_second_grid() {
        let schedule = ScheduleSpec::fixed_interval(Duration::from_secs(30)).parse().unwrap();
        let after = at(2024, 5, 1, 12, 0, 0) + chrono::Duration::milliseconds(750);
        assert_eq!(schedule.next(after), Some(at(2024, 5, 1, 12, 0, 30)));
        assert_eq!(schedule.first(after), schedule.next(after));
    }

    #[test]
    fn test_invalid_cron_wraps_expression() {
        for bad in ["not a cron", "* * * *", "* * * * * *", "61 * * * *", "* * * * 9", "@fortnightly"] {
            let err = ScheduleSpec::cron(bad).parse().unwrap_err();
            let message = err.to_string();
            assert!(message.contains("invalid cron string"), "{message}");
            assert!(message.contains(bad), "{message}");
        }
    }

    #[test]
    fn test_five_field_cron_next() {
        let schedule = ScheduleSpec::cron("*/15 * * * *").parse().unwrap();
        assert_eq!(
            schedule.next(at(2024, 5, 1, 12, 7, 10)),
            Some(at(2024, 5, 1, 12, 15, 0))
        );
        // strictly after
        assert_eq!(
            schedule.next(at(2024, 5, 1, 12, 15, 0)),
            Some(at(2024, 5, 1, 12, 30, 0))
        );
    }

    #[test]
    fn test_posix_day_of_week_numbering() {
        // 2024-05-01 is a Wednesday.
        let sunday = ScheduleSpec::cron("0 9 * * 0").parse().unwrap();
        let next = sunday.next(at(2024, 5, 1, 0, 0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 9);

        let also_sunday = ScheduleSpec::cron("0 9 * * 7").parse().unwrap();
        assert_eq!(also_sunday.next(at(2024, 5, 1, 0, 0, 0)), Some(next));

        let weekdays = ScheduleSpec::cron("30 8 * * 1-5").parse().unwrap();
        let friday_evening = at(2024, 5, 3, 20, 0, 0);
        assert_eq!(
            weekdays.next(friday_evening).unwrap().weekday(),
            Weekday::Mon
        );

        let named = ScheduleSpec::cron("0 0 * * SAT").parse().unwrap();
        assert_eq!(
            named.next(at(2024, 5, 1, 0, 0, 0)).unwrap().weekday(),
            Weekday::Sat
        );
    }

    #[test]
    fn test_restricted_day_fields_match_either() {
        // 2024-05-01 is a Wednesday; the 13th falls on a Monday.
        let schedule = ScheduleSpec::cron("0 0 13 * 5").parse().unwrap();
        let mut fires = Vec::new();
        let mut after = at(2024, 5, 1, 0, 0, 0);
        for _ in 0..4 {
            after = schedule.next(after).unwrap();
            fires.push(after);
        }
        assert_eq!(
            fires,
            vec![
                at(2024, 5, 3, 0, 0, 0),
                at(2024, 5, 10, 0, 0, 0),
                at(2024, 5, 13, 0, 0, 0),
                at(2024, 5, 17, 0, 0, 0),
            ]
        );

        // One wildcard day field keeps the other as the only restriction.
        let fridays = ScheduleSpec::cron("0 0 * * 5").parse().unwrap();
        assert_eq!(fridays.next(at(2024, 5, 3, 0, 0, 0)), Some(at(2024, 5, 10, 0, 0, 0)));
        let thirteenths = ScheduleSpec::cron("0 0 13 * *").parse().unwrap();
        assert_eq!(thirteenths.next(at(2024, 5, 1, 0, 0, 0)), Some(at(2024, 5, 13, 0, 0, 0)));
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
        assert_eq!(translate_day_of_week("0").unwrap(), "1");
        assert_eq!(translate_day_of_week("5-7").unwrap(), "6,7,1");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert_eq!(translate_day_of_week("1,3").unwrap(), "2,4");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_day_of_week("8").is_err());
        assert!(translate_day_of_week("5-1").is_err());
        assert!(translate_day_of_week("*/0").is_err());
    }

    #[test]
    fn test_macros() {
        let hourly = ScheduleSpec::cron("@hourly").parse().unwrap();
        assert_eq!(hourly.next(at(2024, 5, 1, 12, 7, 0)), Some(at(2024, 5, 1, 13, 0, 0)));

        let daily = ScheduleSpec::cron("@daily").parse().unwrap();
        assert_eq!(daily.next(at(2024, 5, 1, 12, 7, 0)), Some(at(2024, 5, 2, 0, 0, 0)));

        let weekly = ScheduleSpec::cron("@weekly").parse().unwrap();
        assert_eq!(
            weekly.next(at(2024, 5, 1, 12, 0, 0)).unwrap().weekday(),
            Weekday::Sun
        );

        let every = ScheduleSpec::cron("@every 1m30s").parse().unwrap();
        assert_eq!(every.next(at(2024, 5, 1, 12, 0, 0)), Some(at(2024, 5, 1, 12, 1, 30)));

        let sub_second = ScheduleSpec::cron("@every 10ms").parse().unwrap();
        assert_eq!(sub_second.next(at(2024, 5, 1, 12, 0, 0)), Some(at(2024, 5, 1, 12, 0, 1)));

        assert!(ScheduleSpec::cron("@every soon").parse().is_err());
    }

    #[test]
    fn test_run_once() {
        let once = ScheduleSpec::run_once().parse().unwrap();
        let now = at(2024, 5, 1, 12, 0, 0);
        assert!(once.is_run_once());
        assert_eq!(once.first(now), Some(now));
        assert_eq!(once.next(now), None);
        assert_eq!(once.to_string(), "once");
    }
}
