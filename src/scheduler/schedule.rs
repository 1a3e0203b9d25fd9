//! Schedule specifications: `once`, `interval:<duration>`, `cron:<expr>`.
//!
//! Durations use the compound `<number><unit>` grammar (`90s`, `1h30m`,
//! `1.5h`, `500ms`). Cron expressions are the standard five-field form
//! evaluated in UTC; numeric day-of-week accepts `0-7` with both `0` and
//! `7` meaning Sunday. When both day-of-month and day-of-week are
//! restricted, a time matches if either field matches.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::ScheduleError;
use crate::scheduler::task::ScheduleType;

/// A parsed schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Once,
    Interval { raw: String, every: TimeDelta },
    Cron(CronSchedule),
}

impl Schedule {
    /// Parse a schedule from its stored type and value.
    pub fn parse(schedule_type: ScheduleType, value: &str) -> Result<Self, ScheduleError> {
        match schedule_type {
            ScheduleType::Once => Ok(Schedule::Once),
            ScheduleType::Interval => {
                let std = parse_duration(value)?;
                let every = TimeDelta::from_std(std).map_err(|e| ScheduleError::InvalidDuration {
                    value: value.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Schedule::Interval {
                    raw: value.trim().to_string(),
                    every,
                })
            }
            ScheduleType::Cron => CronSchedule::parse(value).map(Schedule::Cron),
        }
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Schedule::Once => ScheduleType::Once,
            Schedule::Interval { .. } => ScheduleType::Interval,
            Schedule::Cron(_) => ScheduleType::Cron,
        }
    }

    /// The value half of the specification, as stored.
    pub fn value(&self) -> String {
        match self {
            Schedule::Once => String::new(),
            Schedule::Interval { raw, .. } => raw.clone(),
            Schedule::Cron(cron) => cron.expression.clone(),
        }
    }

    /// Next run after a run that started at `now`. `None` for `once`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => None,
            Schedule::Interval { every, .. } => now.checked_add_signed(*every),
            Schedule::Cron(cron) => cron.next_after(now),
        }
    }

    /// First run for a freshly created task.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => Some(now),
            _ => self.next_after(now),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Once => write!(f, "once"),
            Schedule::Interval { raw, .. } => write!(f, "interval:{raw}"),
            Schedule::Cron(cron) => write!(f, "cron:{}", cron.expression),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "once" {
            return Ok(Schedule::Once);
        }
        match s.split_once(':') {
            Some(("interval", value)) => Schedule::parse(ScheduleType::Interval, value),
            Some(("cron", value)) => Schedule::parse(ScheduleType::Cron, value),
            _ => Err(ScheduleError::UnknownType(s.to_string())),
        }
    }
}

// ── Durations ───────────────────────────────────────────────────────

const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3_600 * 1_000_000_000),
];

/// Parse a compound duration literal such as `1h30m` or `1.5s`.
pub fn parse_duration(value: &str) -> Result<Duration, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let s = value.trim();
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    if rest.starts_with('-') {
        return Err(invalid("negative durations are not allowed"));
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (int_part, after_int) = rest.split_at(int_end);

        let (frac_part, after_num) = match after_int.strip_prefix('.') {
            Some(tail) => {
                let frac_end = tail
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(tail.len());
                tail.split_at(frac_end)
            }
            None => ("", after_int),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("expected a number"));
        }

        let unit_end = after_num
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_num.len());
        let (unit, tail) = after_num.split_at(unit_end);
        if unit.is_empty() {
            return Err(invalid("missing unit"));
        }
        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, nanos)| *nanos)
            .ok_or_else(|| invalid(&format!("unknown unit '{unit}'")))?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid("number too large"))?
        };
        total = whole
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| invalid("duration overflows"))?;

        if !frac_part.is_empty() {
            // Digits past nanosecond precision cannot contribute.
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| invalid("bad fraction"))?;
            let denominator = 10u128.pow(digits.len() as u32);
            total += numerator * scale / denominator;
        }

        rest = tail;
    }

    if total == 0 {
        return Err(invalid("duration must be positive"));
    }
    let nanos = u64::try_from(total).map_err(|_| invalid("duration overflows"))?;
    Ok(Duration::from_nanos(nanos))
}

// ── Cron ────────────────────────────────────────────────────────────

/// A five-field cron expression compiled for the `cron` crate.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// One entry normally; two when day-of-month and day-of-week are both
    /// restricted and either may match.
    compiled: Vec<cron::Schedule>,
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let expression = expression.trim();
        let invalid = |reason: String| ScheduleError::InvalidCron {
            value: expression.to_string(),
            reason,
        };

        let expanded = expand_descriptor(expression).unwrap_or(expression);
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        };

        let dom_restricted = !matches!(dom, "*" | "?");
        let dow_restricted = !matches!(dow, "*" | "?");
        let dow = normalize_day_of_week(dow).map_err(invalid)?;

        let sources = if dom_restricted && dow_restricted {
            vec![
                format!("0 {minute} {hour} {dom} {month} *"),
                format!("0 {minute} {hour} * {month} {dow}"),
            ]
        } else {
            let dom = if dom == "?" { "*" } else { dom };
            vec![format!("0 {minute} {hour} {dom} {month} {dow}")]
        };

        let compiled = sources
            .iter()
            .map(|src| cron::Schedule::from_str(src).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            expression: expression.to_string(),
            compiled,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Earliest matching time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.compiled
            .iter()
            .filter_map(|schedule| schedule.after(&now).find(|t| *t > now))
            .min()
    }
}

fn expand_descriptor(expression: &str) -> Option<&'static str> {
    match expression {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// Rewrite a day-of-week field as an explicit list of day names.
///
/// Standard cron numbers Sunday as 0 (or 7); the `cron` crate numbers it 1.
/// Emitting names sidesteps the mismatch.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if matches!(field, "*" | "?") {
        return Ok("*".to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in day-of-week"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_day(a)?, parse_day(b)?)
        } else {
            let day = parse_day(range)?;
            (day, if step.is_some() { 6 } else { day })
        };
        if start > end {
            return Err(format!("day-of-week range '{range}' is backwards"));
        }

        let step = step.unwrap_or(1) as usize;
        for day in (start..=end).step_by(step) {
            days[day as usize % 7] = true;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, on)| *on)
        .map(|(name, _)| *name)
        .collect();
    Ok(names.join(","))
}

fn parse_day(token: &str) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {n} out of range 0-7"))
        };
    }
    let upper = token.to_ascii_uppercase();
    DAY_NAMES
        .iter()
        .position(|name| upper == *name)
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}
