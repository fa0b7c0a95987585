use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    store::{ExecutionFilter, JobFilter, Store, TriggerFilter},
    types::{fire_order, ExecutionRecord, Job, JobKey, Outcome, Trigger, TriggerKey, TriggerState},
};

#[derive(Default)]
struct MemoryState {
    jobs: BTreeMap<JobKey, Job>,
    triggers: BTreeMap<TriggerKey, Trigger>,
    executions: Vec<ExecutionRecord>,
}

/// Process-local [`Store`]. Nothing survives a restart unless the same
/// instance is handed to the next engine, which is how tests simulate one.
///
/// `set_unavailable(true)` makes every call fail with `StoreUnavailable`,
/// for exercising the engine's retry path; `fail_next_inserts` does the
/// same for execution inserts only.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    failing_inserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut state = self.lock()?;
        if state.jobs.contains_key(&job.key) {
            return Err(SchedulerError::JobExists {
                key: job.key.to_string(),
            });
        }
        state.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(key).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job.key) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound {
                key: job.key.to_string(),
            }),
        }
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let mut state = self.lock()?;
        let existed = state.jobs.remove(key).is_some();
        state.triggers.retain(|_, t| t.job_key != *key);
        Ok(existed)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut state = self.lock()?;
        if !state.jobs.contains_key(&trigger.job_key) {
            return Err(SchedulerError::JobNotFound {
                key: trigger.job_key.to_string(),
            });
        }
        if state.triggers.contains_key(&trigger.key) {
            return Err(SchedulerError::TriggerExists {
                key: trigger.key.to_string(),
            });
        }
        state.triggers.insert(trigger.key.clone(), trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        Ok(self.lock()?.triggers.get(key).cloned())
    }

    async fn update_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut state = self.lock()?;
        match state.triggers.get_mut(&trigger.key) {
            Some(existing) => {
                *existing = trigger.clone();
                Ok(())
            }
            None => Err(SchedulerError::TriggerNotFound {
                key: trigger.key.to_string(),
            }),
        }
    }

    async fn update_trigger_if(&self, trigger: &Trigger, expected: TriggerState) -> Result<bool> {
        let mut state = self.lock()?;
        match state.triggers.get_mut(&trigger.key) {
            Some(existing) if existing.state == expected => {
                *existing = trigger.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_trigger(&self, key: &TriggerKey) -> Result<bool> {
        Ok(self.lock()?.triggers.remove(key).is_some())
    }

    async fn query_triggers(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>> {
        let state = self.lock()?;
        Ok(state
            .triggers
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn acquire_due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Trigger>> {
        // The whole select-and-flip happens under one lock acquisition.
        let mut state = self.lock()?;
        let mut due: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|t| {
                t.state == TriggerState::Waiting && t.next_fire_time.is_some_and(|next| next <= now)
            })
            .cloned()
            .collect();
        due.sort_by(fire_order);
        due.truncate(limit);

        for trigger in &mut due {
            trigger.state = TriggerState::Acquired;
            if let Some(stored) = state.triggers.get_mut(&trigger.key) {
                stored.state = TriggerState::Acquired;
            }
        }
        Ok(due)
    }

    async fn transition_trigger(
        &self,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        match state.triggers.get_mut(key) {
            Some(t) if t.state == from => {
                t.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn earliest_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.lock()?;
        Ok(state
            .triggers
            .values()
            .filter(|t| t.state == TriggerState::Waiting)
            .filter_map(|t| t.next_fire_time)
            .min())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut state = self.lock()?;
        if self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SchedulerError::StoreUnavailable(
                "execution insert rejected".to_string(),
            ));
        }
        state.executions.push(record.clone());
        Ok(())
    }

    async fn complete_execution(
        &self,
        fire_id: Uuid,
        finished_at: DateTime<Utc>,
        outcome: &Outcome,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(record) = state.executions.iter_mut().find(|r| r.fire_id == fire_id) {
            record.finished_at = Some(finished_at);
            record.outcome = Some(outcome.clone());
        }
        Ok(())
    }

    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let state = self.lock()?;
        // Insertion order is fire order; newest first.
        let records = state
            .executions
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(records)
    }

    async fn prune_executions(&self, job: &JobKey, keep: usize) -> Result<usize> {
        let mut state = self.lock()?;
        let mut seen = 0;
        let mut retained: Vec<bool> = state
            .executions
            .iter()
            .rev()
            .map(|r| {
                if r.job_key != *job {
                    return true;
                }
                seen += 1;
                seen <= keep || r.finished_at.is_none()
            })
            .collect();
        retained.reverse();

        let before = state.executions.len();
        let mut retained = retained.into_iter();
        state
            .executions
            .retain(|_| retained.next().unwrap_or(true));
        Ok(before - state.executions.len())
    }
}
