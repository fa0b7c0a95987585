use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    engine::Shared,
    error::{Result, SchedulerError},
    executor::RunningFire,
    schedule::{compute_next_fire_time, first_fire_time},
    store::{ExecutionFilter, JobFilter, TriggerFilter},
    types::{
        ConcurrencyPolicy, ExecutionRecord, Job, JobKey, JobState, JobStatus, Trigger, TriggerKey,
        TriggerState,
    },
};

/// Bounded retries for compare-and-set loops racing the dispatch loop.
const CAS_ATTEMPTS: usize = 8;

/// Management API over a running (or not yet started) engine.
///
/// Cheap to clone; every mutation wakes the dispatch loop so new or changed
/// fire times are picked up without waiting for the idle poll.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn wake(&self) {
        self.shared.wake.notify_one();
    }

    fn validate_job(&self, job: &Job) -> Result<()> {
        if !self.shared.executor.registry().contains(&job.payload) {
            return Err(SchedulerError::Configuration(format!(
                "job {}: no payload registered as '{}'",
                job.key, job.payload
            )));
        }
        if job.concurrency == ConcurrencyPolicy::AllowConcurrent && job.max_concurrent == Some(0) {
            return Err(SchedulerError::Configuration(format!(
                "job {}: max_concurrent must be at least 1",
                job.key
            )));
        }
        Ok(())
    }

    /// Validate a new trigger and compute its first fire.
    fn prepare_trigger(&self, mut trigger: Trigger) -> Result<Trigger> {
        trigger.schedule.validate()?;
        trigger.state = TriggerState::Waiting;
        trigger.previous_fire_time = None;
        trigger.times_triggered = 0;
        trigger.next_fire_time = first_fire_time(&trigger, self.shared.clock.now());
        if trigger.next_fire_time.is_none() {
            return Err(SchedulerError::Configuration(format!(
                "trigger {} will never fire",
                trigger.key
            )));
        }
        Ok(trigger)
    }

    /// Remember non-durable definitions so startup recovery keeps them.
    /// A trigger also pins its job, which may predate this process.
    fn track(&self, trigger: &Trigger) {
        self.shared.live.add_job(&trigger.job_key);
        if !trigger.durable {
            self.shared.live.add_trigger(&trigger.key);
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register `job` and bind `trigger` to it. Nothing is persisted if
    /// either definition is invalid or the job key is taken.
    pub async fn schedule_job(&self, job: Job, trigger: Trigger) -> Result<TriggerHandle> {
        self.validate_job(&job)?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::Configuration(format!(
                "trigger {} references {}, not {}",
                trigger.key, trigger.job_key, job.key
            )));
        }
        let trigger = self.prepare_trigger(trigger)?;

        self.track(&trigger);
        let store = self.shared.store.as_ref();
        store.create_job(&job).await?;
        if let Err(e) = store.create_trigger(&trigger).await {
            store.delete_job(&job.key).await?;
            return Err(e);
        }
        info!(
            job = %job.key,
            trigger = %trigger.key,
            next_fire = ?trigger.next_fire_time,
            "job scheduled"
        );
        self.wake();
        Ok(TriggerHandle::new(trigger.key, self.clone()))
    }

    /// Store a job without triggers, or replace an existing definition when
    /// `replace` is set. A job with no triggers must be durable.
    pub async fn add_job(&self, job: Job, replace: bool) -> Result<()> {
        self.validate_job(&job)?;
        let store = self.shared.store.as_ref();
        if store.get_job(&job.key).await?.is_some() {
            if !replace {
                return Err(SchedulerError::JobExists {
                    key: job.key.to_string(),
                });
            }
            if !job.durable {
                self.shared.live.add_job(&job.key);
            }
            store.update_job(&job).await?;
            info!(job = %job.key, "job replaced");
        } else {
            if !job.durable {
                return Err(SchedulerError::Configuration(format!(
                    "job {} has no triggers and must be durable",
                    job.key
                )));
            }
            store.create_job(&job).await?;
            info!(job = %job.key, "job added");
        }
        Ok(())
    }

    /// Bind a new trigger to an existing job.
    pub async fn schedule_trigger(&self, trigger: Trigger) -> Result<TriggerHandle> {
        let trigger = self.prepare_trigger(trigger)?;
        self.track(&trigger);
        self.shared.store.create_trigger(&trigger).await?;
        info!(
            job = %trigger.job_key,
            trigger = %trigger.key,
            next_fire = ?trigger.next_fire_time,
            "trigger scheduled"
        );
        self.wake();
        Ok(TriggerHandle::new(trigger.key, self.clone()))
    }

    /// Replace the trigger stored under `key` with `trigger`, keeping the key.
    pub async fn reschedule_trigger(&self, key: &TriggerKey, mut trigger: Trigger) -> Result<TriggerHandle> {
        trigger.key = key.clone();
        let trigger = self.prepare_trigger(trigger)?;
        self.track(&trigger);
        let store = self.shared.store.as_ref();
        if !store.delete_trigger(key).await? {
            return Err(SchedulerError::TriggerNotFound {
                key: key.to_string(),
            });
        }
        store.create_trigger(&trigger).await?;
        info!(trigger = %key, next_fire = ?trigger.next_fire_time, "trigger rescheduled");
        self.wake();
        Ok(TriggerHandle::new(trigger.key, self.clone()))
    }

    // ── Trigger state ───────────────────────────────────────────────

    async fn load_trigger(&self, key: &TriggerKey) -> Result<Trigger> {
        self.shared
            .store
            .get_trigger(key)
            .await?
            .ok_or_else(|| SchedulerError::TriggerNotFound {
                key: key.to_string(),
            })
    }

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let trigger = self.load_trigger(key).await?;
            match trigger.state {
                TriggerState::Paused => return Ok(()),
                TriggerState::Complete => {
                    return Err(SchedulerError::InvalidState {
                        key: key.to_string(),
                        reason: "a complete trigger cannot be paused".to_string(),
                    })
                }
                from => {
                    if self
                        .shared
                        .store
                        .transition_trigger(key, from, TriggerState::Paused)
                        .await?
                    {
                        info!(trigger = %key, from = %from, "trigger paused");
                        self.wake();
                        return Ok(());
                    }
                }
            }
        }
        Err(contended(key))
    }

    /// `Paused`/`Error` back to `Waiting`. A missing next fire is recomputed
    /// from now; a past one is kept so the misfire policy decides.
    ///
    /// A trigger paused mid-fire resumes as `Executing` while that fire is
    /// still running, so its completion settles it and no second fire of
    /// the same trigger can start meanwhile.
    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let _settling = self.shared.settle_lock.lock().await;
            let mut trigger = self.load_trigger(key).await?;
            let from = trigger.state;
            match from {
                TriggerState::Paused | TriggerState::Error => {}
                TriggerState::Complete => {
                    return Err(SchedulerError::InvalidState {
                        key: key.to_string(),
                        reason: "a complete trigger cannot be resumed".to_string(),
                    })
                }
                _ => return Ok(()),
            }

            // A fire leaves the running set before its completion is sent,
            // and completions only settle `Executing`.
            if from == TriggerState::Paused && self.shared.executor.is_running_trigger(key) {
                if self
                    .shared
                    .store
                    .transition_trigger(key, from, TriggerState::Executing)
                    .await?
                {
                    info!(trigger = %key, "trigger resumed; waiting for its running fire");
                    return Ok(());
                }
                continue;
            }

            if trigger.next_fire_time.is_none() {
                trigger.next_fire_time = compute_next_fire_time(&trigger, self.shared.clock.now());
            }
            let resumed = trigger.next_fire_time.is_some();
            trigger.state = if resumed {
                TriggerState::Waiting
            } else {
                TriggerState::Complete
            };
            if self.shared.store.update_trigger_if(&trigger, from).await? {
                if resumed {
                    info!(trigger = %key, next_fire = ?trigger.next_fire_time, "trigger resumed");
                } else {
                    info!(trigger = %key, "trigger has no fires left; marked complete");
                    self.shared.retire(&trigger).await?;
                }
                self.wake();
                return Ok(());
            }
        }
        Err(contended(key))
    }

    /// Remove one trigger. A running fire finishes; its completion finds the
    /// trigger gone and leaves it that way.
    pub async fn unschedule_job(&self, key: &TriggerKey) -> Result<bool> {
        let Some(trigger) = self.shared.store.get_trigger(key).await? else {
            return Ok(false);
        };
        let removed = self.shared.store.delete_trigger(key).await?;
        if removed {
            info!(trigger = %key, job = %trigger.job_key, "trigger unscheduled");
            self.shared.drop_if_orphaned(&trigger.job_key).await?;
            self.wake();
        }
        Ok(removed)
    }

    // ── Job-level operations ────────────────────────────────────────

    async fn job_triggers(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        if self.shared.store.get_job(key).await?.is_none() {
            return Err(SchedulerError::JobNotFound {
                key: key.to_string(),
            });
        }
        self.shared
            .store
            .query_triggers(&TriggerFilter::for_job(key))
            .await
    }

    /// Pause every trigger of a job. Complete triggers are left alone.
    pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
        for trigger in self.job_triggers(key).await? {
            if trigger.state != TriggerState::Complete {
                self.pause_trigger(&trigger.key).await?;
            }
        }
        Ok(())
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
        for trigger in self.job_triggers(key).await? {
            if matches!(trigger.state, TriggerState::Paused | TriggerState::Error) {
                self.resume_trigger(&trigger.key).await?;
            }
        }
        Ok(())
    }

    /// Delete a job and all of its triggers. Running instances are not interrupted.
    pub async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let deleted = self.shared.store.delete_job(key).await?;
        if deleted {
            info!(job = %key, "job deleted");
            self.wake();
        }
        Ok(deleted)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_job_status(&self, key: &JobKey) -> Result<JobStatus> {
        let triggers = self.job_triggers(key).await?;
        let running = self
            .shared
            .executor
            .executing()
            .iter()
            .any(|f| f.job_key == *key);
        let has = |state: TriggerState| triggers.iter().any(|t| t.state == state);

        let current_state = if running || has(TriggerState::Executing) {
            JobState::Executing
        } else if has(TriggerState::Waiting) || has(TriggerState::Acquired) {
            JobState::Scheduled
        } else if has(TriggerState::Paused) {
            JobState::Paused
        } else if has(TriggerState::Error) {
            JobState::Error
        } else if !triggers.is_empty() {
            JobState::Complete
        } else {
            JobState::Unscheduled
        };

        let next_fire_time = triggers
            .iter()
            .filter(|t| {
                matches!(
                    t.state,
                    TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing
                )
            })
            .filter_map(|t| t.next_fire_time)
            .min();

        let store = self.shared.store.as_ref();
        let last_fired_at = store
            .query_executions(&ExecutionFilter {
                job: Some(key.clone()),
                limit: Some(1),
                ..ExecutionFilter::default()
            })
            .await?
            .first()
            .map(|r| r.fired_at);
        let last_result = store
            .query_executions(&ExecutionFilter {
                job: Some(key.clone()),
                running: Some(false),
                limit: Some(1),
                ..ExecutionFilter::default()
            })
            .await?
            .into_iter()
            .next()
            .and_then(|r| r.outcome);

        debug!(job = %key, state = ?current_state, "job status computed");
        Ok(JobStatus {
            job_key: key.clone(),
            current_state,
            next_fire_time,
            last_result,
            last_fired_at,
        })
    }

    pub async fn get_job(&self, key: &JobKey) -> Result<Option<Job>> {
        self.shared.store.get_job(key).await
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.shared.store.get_trigger(key).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.shared.store.query_jobs(filter).await
    }

    pub async fn list_triggers(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>> {
        self.shared.store.query_triggers(filter).await
    }

    pub async fn job_groups(&self) -> Result<Vec<String>> {
        self.shared.store.job_groups().await
    }

    pub async fn trigger_groups(&self) -> Result<Vec<String>> {
        self.shared.store.trigger_groups().await
    }

    pub async fn execution_history(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        self.shared.store.query_executions(filter).await
    }

    pub fn executing_jobs(&self) -> Vec<RunningFire> {
        self.shared.executor.executing()
    }

    /// Signal every running instance of `key` to stop. Returns how many were
    /// signalled; payloads that ignore their token run to completion.
    pub fn interrupt_job(&self, key: &JobKey) -> usize {
        let n = self.shared.executor.interrupt_job(key);
        if n > 0 {
            info!(job = %key, instances = n, "job interrupted");
        }
        n
    }
}

fn contended(key: &TriggerKey) -> SchedulerError {
    SchedulerError::InvalidState {
        key: key.to_string(),
        reason: "state kept changing under concurrent updates".to_string(),
    }
}

/// A trigger key bound to the handle that scheduled it.
#[derive(Clone)]
pub struct TriggerHandle {
    key: TriggerKey,
    scheduler: SchedulerHandle,
}

impl std::fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerHandle").field("key", &self.key).finish()
    }
}

impl TriggerHandle {
    fn new(key: TriggerKey, scheduler: SchedulerHandle) -> Self {
        Self { key, scheduler }
    }

    pub fn key(&self) -> &TriggerKey {
        &self.key
    }

    pub async fn pause(&self) -> Result<()> {
        self.scheduler.pause_trigger(&self.key).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.scheduler.resume_trigger(&self.key).await
    }

    pub async fn unschedule(&self) -> Result<bool> {
        self.scheduler.unschedule_job(&self.key).await
    }

    /// Current state, or `None` once the trigger is gone.
    pub async fn state(&self) -> Result<Option<TriggerState>> {
        Ok(self.scheduler.get_trigger(&self.key).await?.map(|t| t.state))
    }

    pub async fn next_fire_time(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        Ok(self
            .scheduler
            .get_trigger(&self.key)
            .await?
            .and_then(|t| t.next_fire_time))
    }
}
