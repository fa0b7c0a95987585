//! Startup reconciliation between persisted state and a fresh dispatch loop.
//!
//! A process that died mid-fire leaves triggers `Acquired` or `Executing` and
//! execution records without an outcome. Recovery repairs both before the
//! first pass, without refiring an instant already recorded as fired.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    misfire::{self, FirePlan},
    schedule::compute_next_fire_time,
    store::{ExecutionFilter, JobFilter, Store, TriggerFilter},
    types::{JobKey, MisfirePolicy, Outcome, TriggerKey, TriggerState},
};

/// Counts per recovery step and per classification of waiting triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub discarded_jobs: usize,
    pub discarded_triggers: usize,
    /// Execution records closed as failed.
    pub interrupted_executions: usize,
    /// Triggers reset from `Acquired`/`Executing` to `Waiting`.
    pub recovered: usize,
    pub future: usize,
    /// Late but within the misfire threshold.
    pub due: usize,
    pub misfired: usize,
    /// No next fire; marked `Complete`.
    pub expired: usize,
}

/// Non-durable jobs and triggers registered by the running process.
/// Recovery keeps these; every other non-durable entity is stale.
#[derive(Debug, Default)]
pub struct LiveKeys {
    jobs: DashSet<JobKey>,
    triggers: DashSet<TriggerKey>,
}

impl LiveKeys {
    pub fn add_job(&self, key: &JobKey) {
        self.jobs.insert(key.clone());
    }

    pub fn add_trigger(&self, key: &TriggerKey) {
        self.triggers.insert(key.clone());
    }

    pub fn has_job(&self, key: &JobKey) -> bool {
        self.jobs.contains(key)
    }

    pub fn has_trigger(&self, key: &TriggerKey) -> bool {
        self.triggers.contains(key)
    }
}

pub async fn recover(
    store: &dyn Store,
    now: DateTime<Utc>,
    default_threshold: Duration,
    live: &LiveKeys,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    // Non-durable entities of a previous process are gone with it.
    for job in store.query_jobs(&JobFilter::default()).await? {
        if job.durable || live.has_job(&job.key) {
            continue;
        }
        if store.delete_job(&job.key).await? {
            debug!(job = %job.key, "discarded non-durable job");
            report.discarded_jobs += 1;
        }
    }
    for trigger in store.query_triggers(&TriggerFilter::default()).await? {
        if trigger.durable || live.has_trigger(&trigger.key) {
            continue;
        }
        if store.delete_trigger(&trigger.key).await? {
            debug!(trigger = %trigger.key, "discarded non-durable trigger");
            report.discarded_triggers += 1;
        }
    }

    let interrupted = Outcome::failure("scheduler stopped before completion");
    for record in store.query_executions(&ExecutionFilter::running()).await? {
        store
            .complete_execution(record.fire_id, now, &interrupted)
            .await?;
        warn!(fire_id = %record.fire_id, job = %record.job_key, "execution interrupted by restart");
        report.interrupted_executions += 1;
    }

    let in_flight = store
        .query_triggers(&TriggerFilter::in_states([
            TriggerState::Acquired,
            TriggerState::Executing,
        ]))
        .await?;
    for mut trigger in in_flight {
        let from = trigger.state;
        // Recompute from the last recorded fire, but never move earlier than
        // the stored instant: it may already reflect a skipped misfire.
        let recomputed = trigger
            .previous_fire_time
            .and_then(|prev| compute_next_fire_time(&trigger, prev));
        trigger.next_fire_time = recomputed.max(trigger.next_fire_time);
        trigger.state = TriggerState::Waiting;
        if store.update_trigger_if(&trigger, from).await? {
            info!(trigger = %trigger.key, from = %from, next_fire = ?trigger.next_fire_time, "in-flight trigger reset");
            report.recovered += 1;
        }
    }

    for mut trigger in store
        .query_triggers(&TriggerFilter::in_states([TriggerState::Waiting]))
        .await?
    {
        let Some(next) = trigger.next_fire_time else {
            trigger.state = TriggerState::Complete;
            if store
                .update_trigger_if(&trigger, TriggerState::Waiting)
                .await?
            {
                report.expired += 1;
            }
            continue;
        };
        if next > now {
            report.future += 1;
            continue;
        }
        if !misfire::is_misfired(&trigger, now, default_threshold) {
            report.due += 1;
            continue;
        }

        report.misfired += 1;
        warn!(trigger = %trigger.key, scheduled = %next, policy = %trigger.misfire_policy, "misfire detected during recovery");
        // Other policies fire, so the first pass applies them.
        if trigger.misfire_policy != MisfirePolicy::DoNothing {
            continue;
        }
        if let Some(FirePlan::Skip { next, .. }) = misfire::plan(&trigger, now, default_threshold) {
            trigger.next_fire_time = next;
            if next.is_none() {
                trigger.state = TriggerState::Complete;
                report.expired += 1;
            }
            store
                .update_trigger_if(&trigger, TriggerState::Waiting)
                .await?;
        }
    }

    Ok(report)
}
