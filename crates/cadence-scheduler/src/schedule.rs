//! Trigger evaluation: pure fire-time computation for simple and cron schedules.
//!
//! Everything here is side-effect free so recovery can call it without
//! touching persisted state. All "next" computations use strictly-greater
//! semantics: an `after` that sits exactly on a fire instant never yields
//! that instant again.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SchedulerError},
    types::Trigger,
};

/// Defines when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// `start + n * interval` for `n` in `0..=repeat_count` (unbounded when `None`).
    Simple {
        start: DateTime<Utc>,
        interval_ms: u64,
        #[serde(default)]
        repeat_count: Option<u32>,
    },

    /// Cron expression evaluated in an IANA time zone.
    Cron {
        expression: String,
        #[serde(default = "default_time_zone")]
        time_zone: String,
    },
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Schedule {
    /// Repeating schedule: `repeat_count` extra fires after the first, or forever.
    pub fn simple(start: DateTime<Utc>, interval: Duration, repeat_count: Option<u32>) -> Self {
        Schedule::Simple {
            start,
            // Saturates; `validate` rejects anything chrono cannot represent.
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            repeat_count,
        }
    }

    /// A single fire at `at`.
    pub fn once(at: DateTime<Utc>) -> Self {
        Schedule::Simple {
            start: at,
            interval_ms: 0,
            repeat_count: Some(0),
        }
    }

    pub fn cron(expression: impl Into<String>, time_zone: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
            time_zone: time_zone.into(),
        }
    }

    /// Reject definitions that could never be evaluated.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Simple {
                start,
                interval_ms,
                repeat_count,
            } => {
                if *interval_ms == 0 && *repeat_count != Some(0) {
                    return Err(SchedulerError::Configuration(
                        "repeating simple schedule requires a non-zero interval".to_string(),
                    ));
                }
                if *repeat_count != Some(0) {
                    let second = i64::try_from(*interval_ms)
                        .ok()
                        .and_then(chrono::Duration::try_milliseconds)
                        .and_then(|step| start.checked_add_signed(step));
                    if second.is_none() {
                        return Err(SchedulerError::Configuration(format!(
                            "interval of {interval_ms}ms is out of range"
                        )));
                    }
                }
                Ok(())
            }
            Schedule::Cron {
                expression,
                time_zone,
            } => {
                parse_cron(expression)?;
                parse_time_zone(time_zone)?;
                Ok(())
            }
        }
    }

    /// Smallest fire instant strictly greater than `after`, or `None` once exhausted.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Simple {
                start,
                interval_ms,
                repeat_count,
            } => next_simple(*start, *interval_ms, *repeat_count, after),
            Schedule::Cron {
                expression,
                time_zone,
            } => {
                // Definitions are validated before they are stored; a parse
                // failure here means the record is unusable, i.e. exhausted.
                let schedule = parse_cron(expression).ok()?;
                let tz = parse_time_zone(time_zone).ok()?;
                schedule
                    .after(&after.with_timezone(&tz))
                    .map(|dt| dt.with_timezone(&Utc))
                    .find(|dt| *dt > after)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Simple { .. } => "simple",
            Schedule::Cron { .. } => "cron",
        }
    }
}

fn next_simple(
    start: DateTime<Utc>,
    interval_ms: u64,
    repeat_count: Option<u32>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if after < start {
        return Some(start);
    }
    if interval_ms == 0 {
        return None;
    }

    let interval = i64::try_from(interval_ms).ok()?;
    let elapsed = (after - start).num_milliseconds();
    let n = elapsed / interval + 1;
    if let Some(max) = repeat_count {
        if n > max as i64 {
            return None;
        }
    }

    // n * interval > floor(after - start), so the candidate is strictly after `after`.
    // Past the representable range the schedule is exhausted.
    let offset = chrono::Duration::try_milliseconds(n.checked_mul(interval)?)?;
    start.checked_add_signed(offset)
}

/// Next fire for `trigger` strictly after `after`, honouring its end time.
pub fn compute_next_fire_time(trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    trigger
        .schedule
        .next_after(after)
        .filter(|next| trigger.end_time.is_none_or(|end| *next <= end))
}

/// First fire for a newly scheduled trigger.
///
/// Simple triggers fire at their start even if it already passed, so the
/// misfire policy decides what happens to a late registration. Cron triggers
/// start with the first match after `now`.
pub fn first_fire_time(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &trigger.schedule {
        Schedule::Simple { start, .. } => {
            compute_next_fire_time(trigger, *start - chrono::Duration::milliseconds(1))
        }
        Schedule::Cron { .. } => compute_next_fire_time(trigger, now),
    }
}

/// Convert a classic 5-field expression to the seconds-first form and treat
/// `?` as a wildcard.
fn normalize_cron_expr(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = fields
        .iter()
        .map(|f| if *f == "?" { "*" } else { *f })
        .collect::<Vec<_>>()
        .join(" ");
    if fields.len() == 5 {
        format!("0 {normalized}")
    } else {
        normalized
    }
}

pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let normalized = normalize_cron_expr(expression);
    cron::Schedule::from_str(&normalized).map_err(|e| {
        SchedulerError::Configuration(format!("invalid cron expression '{expression}': {e}"))
    })
}

pub(crate) fn parse_time_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::Configuration(format!("unknown time zone '{name}'")))
}
