/// Cron expression parsing and next-fire computation
///
/// Supports 5-field (`min hour dom month dow`) and 6-field (`sec min hour dom
/// month dow`) expressions, `@` aliases, month and weekday names, ranges, steps
/// and lists. Each field is compiled into a bitmask; the next fire time is found
/// by walking forward field by field in the schedule's local time.
///
/// Schedules evaluate in UTC, a fixed offset or an IANA zone. A local fire time
/// that a DST transition skips runs shifted forward by the length of the gap; one
/// that a transition repeats runs once, at its first occurrence.

use crate::error::{OrchestratorError, Result};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, Offset,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// How far ahead `next_after` searches before giving up
const SEARCH_YEARS: i32 = 5;

/// Largest accepted fixed offset, in hours
const MAX_OFFSET_HOURS: i32 = 14;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`
    names_base: u32,
}

const SECONDS: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[], names_base: 0 };
const MINUTES: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOURS: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAYS_OF_MONTH: FieldSpec = FieldSpec { name: "day of month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTHS: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES, names_base: 1 };
// 7 is accepted as an alias for Sunday and folded onto 0
const DAYS_OF_WEEK: FieldSpec = FieldSpec { name: "day of week", min: 0, max: 7, names: WEEKDAY_NAMES, names_base: 0 };

/// A compiled cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let source = expression.trim();
        let expanded = expand_alias(source);
        let fields: Vec<&str> = expanded.split_whitespace().collect();

        let (second, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(invalid(
                    source,
                    format!("expected 5 or 6 fields, found {}", n),
                ))
            }
        };

        let field = |text: &str, spec: &FieldSpec| {
            parse_field(text, spec).map_err(|reason| invalid(source, reason))
        };

        let mut days_of_week = field(rest[4], &DAYS_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: source.to_string(),
            seconds: field(second, &SECONDS)?,
            minutes: field(rest[0], &MINUTES)?,
            hours: field(rest[1], &HOURS)?,
            days_of_month: field(rest[2], &DAYS_OF_MONTH)?,
            months: field(rest[3], &MONTHS)?,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, evaluated in `timezone`
    ///
    /// Returns `None` when nothing matches within the search horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>, timezone: &ScheduleTimezone) -> Option<DateTime<Utc>> {
        let start = DateTime::<Utc>::from_timestamp(after.timestamp().checked_add(1)?, 0)?;
        let mut candidate = timezone.to_local(start);
        let horizon = candidate.year() + SEARCH_YEARS;

        while candidate.year() <= horizon {
            if !bit(self.months, candidate.month()) {
                candidate = first_of_next_month(candidate.date())?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = truncate_to_hour(candidate)? + ChronoDuration::hours(1);
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate = truncate_to_minute(candidate)? + ChronoDuration::minutes(1);
                continue;
            }
            if !bit(self.seconds, candidate.second()) {
                candidate += ChronoDuration::seconds(1);
                continue;
            }
            match timezone.resolve(candidate) {
                Some(fire) if fire > after => return Some(fire),
                // first occurrence of a repeated local time already passed
                _ => candidate += ChronoDuration::seconds(1),
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn expand_alias(expression: &str) -> String {
    let expanded = match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        "@monthly" => "0 0 0 1 * *",
        "@weekly" => "0 0 0 * * 0",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@hourly" => "0 0 * * * *",
        _ => return expression.to_string(),
    };
    expanded.to_string()
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(text: &str, spec: &FieldSpec) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `a/n` means "from a to the end of the range every n"
            (value, if step.is_some() { spec.max } else { value })
        };

        if low > high {
            return Err(format!("range {}-{} is reversed in {} field", low, high, spec.name));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (low..=high).step_by(step) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn parse_value(text: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(value) => value,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|index| index as u32 + spec.names_base)
            .ok_or_else(|| format!("invalid value '{}' in {} field", text, spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn truncate_to_hour(at: NaiveDateTime) -> Option<NaiveDateTime> {
    at.date().and_hms_opt(at.hour(), 0, 0)
}

fn truncate_to_minute(at: NaiveDateTime) -> Option<NaiveDateTime> {
    at.date().and_hms_opt(at.hour(), at.minute(), 0)
}

/// Timezone a schedule's cron expression is evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleTimezone {
    #[default]
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

impl ScheduleTimezone {
    /// Accepts `UTC`/`GMT`/`Z`/`Etc/UTC`, fixed offsets like `+05:30`, `-0800`,
    /// `UTC+2`, and IANA zone names like `America/New_York`
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let upper = trimmed.to_ascii_uppercase();
        if matches!(upper.as_str(), "UTC" | "GMT" | "Z" | "ETC/UTC" | "ETC/GMT" | "") {
            return Ok(ScheduleTimezone::Utc);
        }

        let offset_text = upper
            .strip_prefix("UTC")
            .or_else(|| upper.strip_prefix("GMT"))
            .unwrap_or(&upper);
        if let Some(seconds) = parse_offset(offset_text) {
            if seconds == 0 {
                return Ok(ScheduleTimezone::Utc);
            }
            return FixedOffset::east_opt(seconds)
                .map(ScheduleTimezone::Fixed)
                .ok_or_else(|| OrchestratorError::InvalidTimezone(trimmed.to_string()));
        }

        trimmed
            .parse::<Tz>()
            .map(ScheduleTimezone::Named)
            .map_err(|_| OrchestratorError::InvalidTimezone(trimmed.to_string()))
    }

    /// UTC offset in effect at `at`
    pub fn offset_at(&self, at: DateTime<Utc>) -> FixedOffset {
        match self {
            ScheduleTimezone::Utc => Utc.fix(),
            ScheduleTimezone::Fixed(offset) => *offset,
            ScheduleTimezone::Named(tz) => tz.offset_from_utc_datetime(&at.naive_utc()).fix(),
        }
    }

    fn to_local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.naive_utc() + ChronoDuration::seconds(i64::from(self.offset_at(at).local_minus_utc()))
    }

    /// Instant a local wall-clock time denotes; gaps shift forward, repeats take the first
    fn resolve(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        let tz = match self {
            ScheduleTimezone::Utc => return Some(Utc.from_utc_datetime(&local)),
            ScheduleTimezone::Fixed(offset) => {
                return offset.from_local_datetime(&local).single().map(|t| t.with_timezone(&Utc))
            }
            ScheduleTimezone::Named(tz) => tz,
        };
        match tz.from_local_datetime(&local) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
            LocalResult::None => {
                // read the skipped time with the offset in force before the transition
                let before = tz.from_local_datetime(&(local - ChronoDuration::days(1))).earliest()?;
                let offset = before.offset().fix().local_minus_utc();
                Some(Utc.from_utc_datetime(&(local - ChronoDuration::seconds(i64::from(offset)))))
            }
        }
    }
}

fn parse_offset(text: &str) -> Option<i32> {
    let (sign, digits) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };

    let (hours, minutes): (i32, i32) = if let Some((h, m)) = digits.split_once(':') {
        (h.parse().ok()?, m.parse().ok()?)
    } else if digits.len() == 4 {
        (digits[..2].parse().ok()?, digits[2..].parse().ok()?)
    } else if (1..=2).contains(&digits.len()) {
        (digits.parse().ok()?, 0)
    } else {
        return None;
    };

    if hours > MAX_OFFSET_HOURS || !(0..60).contains(&minutes) || (hours == MAX_OFFSET_HOURS && minutes > 0) {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

impl FromStr for ScheduleTimezone {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ScheduleTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleTimezone::Utc => f.write_str("UTC"),
            ScheduleTimezone::Fixed(offset) => write!(f, "{}", offset),
            ScheduleTimezone::Named(tz) => f.write_str(tz.name()),
        }
    }
}

impl Serialize for ScheduleTimezone {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
