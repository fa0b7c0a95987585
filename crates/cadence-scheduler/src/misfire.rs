use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    schedule::compute_next_fire_time,
    types::{MisfirePolicy, Trigger},
};

/// How a due trigger should be handled at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirePlan {
    /// On time, or late but within the threshold.
    OnTime {
        scheduled: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
    /// Misfired under `FireNow`: fire once at `now`, continue from `now`.
    FireNow {
        scheduled: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
    /// Misfired under `IgnoreMisfires`: fire for the original instant.
    CatchUp {
        scheduled: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
    /// Misfired under `DoNothing`: no fire, continue from `now`.
    Skip {
        scheduled: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
}

impl FirePlan {
    pub fn is_misfire(&self) -> bool {
        !matches!(self, FirePlan::OnTime { .. })
    }

    pub fn next(&self) -> Option<DateTime<Utc>> {
        match self {
            FirePlan::OnTime { next, .. }
            | FirePlan::FireNow { next, .. }
            | FirePlan::CatchUp { next, .. }
            | FirePlan::Skip { next, .. } => *next,
        }
    }
}

/// True when `now` is past the trigger's next fire by more than its threshold.
pub fn is_misfired(trigger: &Trigger, now: DateTime<Utc>, default_threshold: Duration) -> bool {
    let Some(next) = trigger.next_fire_time else {
        return false;
    };
    let threshold = trigger.misfire_threshold(default_threshold);
    match (now - next).to_std() {
        Ok(late) => late > threshold,
        Err(_) => false, // not due yet
    }
}

/// Decide what to do with a trigger whose `next_fire_time` has arrived.
///
/// Returns `None` for a trigger without a next fire. Pure: the caller
/// persists whatever the plan says.
pub fn plan(trigger: &Trigger, now: DateTime<Utc>, default_threshold: Duration) -> Option<FirePlan> {
    let scheduled = trigger.next_fire_time?;

    if !is_misfired(trigger, now, default_threshold) {
        return Some(FirePlan::OnTime {
            scheduled,
            next: compute_next_fire_time(trigger, scheduled),
        });
    }

    let plan = match trigger.misfire_policy {
        MisfirePolicy::FireNow => FirePlan::FireNow {
            scheduled,
            next: compute_next_fire_time(trigger, now),
        },
        MisfirePolicy::IgnoreMisfires => FirePlan::CatchUp {
            scheduled,
            next: compute_next_fire_time(trigger, scheduled),
        },
        MisfirePolicy::DoNothing => FirePlan::Skip {
            scheduled,
            next: compute_next_fire_time(trigger, now),
        },
    };
    Some(plan)
}
