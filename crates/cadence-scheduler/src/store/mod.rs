//! Durable access to jobs, triggers and execution history.
//!
//! The engine only talks to the [`Store`] trait. `acquire_due_triggers` is the
//! correctness-critical primitive: it must move due triggers from `Waiting` to
//! `Acquired` atomically so no instant is dispatched twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::Result,
    types::{ExecutionRecord, Job, JobKey, Outcome, Trigger, TriggerKey, TriggerState},
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Predicate over jobs. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub group: Option<String>,
    pub payload: Option<String>,
}

impl JobFilter {
    pub fn in_group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.group.as_ref().is_none_or(|g| *g == job.key.group)
            && self.payload.as_ref().is_none_or(|p| *p == job.payload)
    }
}

/// Predicate over triggers. An empty `states` list matches any state.
#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    pub job: Option<JobKey>,
    pub group: Option<String>,
    pub states: Vec<TriggerState>,
}

impl TriggerFilter {
    pub fn for_job(job: &JobKey) -> Self {
        Self {
            job: Some(job.clone()),
            ..Self::default()
        }
    }

    pub fn in_states(states: impl IntoIterator<Item = TriggerState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, trigger: &Trigger) -> bool {
        self.job.as_ref().is_none_or(|j| *j == trigger.job_key)
            && self.group.as_ref().is_none_or(|g| *g == trigger.key.group)
            && (self.states.is_empty() || self.states.contains(&trigger.state))
    }
}

/// Predicate over execution history. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub job: Option<JobKey>,
    pub trigger: Option<TriggerKey>,
    /// `Some(true)`: running only; `Some(false)`: finished only.
    pub running: Option<bool>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_job(job: &JobKey) -> Self {
        Self {
            job: Some(job.clone()),
            ..Self::default()
        }
    }

    pub fn running() -> Self {
        Self {
            running: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.job.as_ref().is_none_or(|j| *j == record.job_key)
            && self.trigger.as_ref().is_none_or(|t| *t == record.trigger_key)
            && self.running.is_none_or(|r| r == record.is_running())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a job. `JobExists` if the key is taken.
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>>;

    /// Replace a job definition. `JobNotFound` if absent.
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Delete a job and every trigger referencing it. Returns whether it existed.
    async fn delete_job(&self, key: &JobKey) -> Result<bool>;

    /// Jobs matching `filter`, ordered by key.
    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    // ── Triggers ────────────────────────────────────────────────────

    /// Insert a trigger. `TriggerExists` if the key is taken, `JobNotFound`
    /// if it references an unknown job.
    async fn create_trigger(&self, trigger: &Trigger) -> Result<()>;

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

    /// Replace a trigger row unconditionally. `TriggerNotFound` if absent.
    async fn update_trigger(&self, trigger: &Trigger) -> Result<()>;

    /// Replace a trigger row only if its stored state is still `expected`.
    async fn update_trigger_if(&self, trigger: &Trigger, expected: TriggerState) -> Result<bool>;

    async fn delete_trigger(&self, key: &TriggerKey) -> Result<bool>;

    /// Triggers matching `filter`, ordered by key.
    async fn query_triggers(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>>;

    /// Atomically move up to `limit` triggers with `state = Waiting` and
    /// `next_fire_time <= now` to `Acquired`, in fire order, and return them.
    async fn acquire_due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Trigger>>;

    /// Compare-and-set on trigger state. Returns whether the swap happened.
    async fn transition_trigger(
        &self,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool>;

    /// Earliest `next_fire_time` among `Waiting` triggers.
    async fn earliest_fire_time(&self) -> Result<Option<DateTime<Utc>>>;

    // ── Execution history ───────────────────────────────────────────

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Close a running record. Idempotent: completing twice keeps the last outcome.
    async fn complete_execution(
        &self,
        fire_id: Uuid,
        finished_at: DateTime<Utc>,
        outcome: &Outcome,
    ) -> Result<()>;

    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>>;

    /// Delete finished records of `job` older than its newest `keep`.
    /// Running records are never pruned. Returns how many were deleted.
    async fn prune_executions(&self, job: &JobKey, keep: usize) -> Result<usize>;

    // ── Derived queries ─────────────────────────────────────────────

    async fn job_groups(&self) -> Result<Vec<String>> {
        let mut groups: Vec<String> = self
            .query_jobs(&JobFilter::default())
            .await?
            .into_iter()
            .map(|j| j.key.group)
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn trigger_groups(&self) -> Result<Vec<String>> {
        let mut groups: Vec<String> = self
            .query_triggers(&TriggerFilter::default())
            .await?
            .into_iter()
            .map(|t| t.key.group)
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }
}
