use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    error::Result,
    executor::{Completion, Executor, JobContext, PayloadRegistry},
    handle::SchedulerHandle,
    misfire::{self, FirePlan},
    recovery::{self, LiveKeys, RecoveryReport},
    store::{Store, TriggerFilter},
    types::{fire_order, merge_data, ExecutionRecord, JobKey, Outcome, Trigger, TriggerState},
};

/// State shared between the dispatch loop and every [`SchedulerHandle`].
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) executor: Executor,
    pub(crate) config: SchedulerConfig,
    /// Raised by handle mutations so the loop re-derives its sleep.
    pub(crate) wake: Notify,
    /// Serialises post-fire settling against `resume_trigger`, which decides
    /// from the executor's running set whether a completion is still due.
    pub(crate) settle_lock: Mutex<()>,
    /// Non-durable keys registered through handles; recovery leaves them.
    pub(crate) live: LiveKeys,
    completions_tx: mpsc::UnboundedSender<Completion>,
}

impl Shared {
    /// Persist `trigger` out of `expected` into `Waiting` (next fire known) or
    /// `Complete` (schedule exhausted). No-op if someone else moved it first.
    pub(crate) async fn settle(&self, mut trigger: Trigger, expected: TriggerState) -> Result<()> {
        trigger.state = if trigger.next_fire_time.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        if !self.store.update_trigger_if(&trigger, expected).await? {
            debug!(trigger = %trigger.key, "trigger changed concurrently; left as is");
            return Ok(());
        }
        if trigger.state == TriggerState::Complete {
            info!(trigger = %trigger.key, fires = trigger.times_triggered, "trigger complete");
            self.retire(&trigger).await?;
        }
        Ok(())
    }

    /// Remove a completed non-durable trigger, then its job if that orphaned it.
    pub(crate) async fn retire(&self, trigger: &Trigger) -> Result<()> {
        if !trigger.durable && self.store.delete_trigger(&trigger.key).await? {
            debug!(trigger = %trigger.key, "non-durable trigger removed");
        }
        self.drop_if_orphaned(&trigger.job_key).await?;
        Ok(())
    }

    /// Delete a non-durable job that no trigger references any more.
    pub(crate) async fn drop_if_orphaned(&self, job_key: &JobKey) -> Result<bool> {
        let Some(job) = self.store.get_job(job_key).await? else {
            return Ok(false);
        };
        if job.durable {
            return Ok(false);
        }
        if !self
            .store
            .query_triggers(&TriggerFilter::for_job(job_key))
            .await?
            .is_empty()
        {
            return Ok(false);
        }
        let deleted = self.store.delete_job(job_key).await?;
        if deleted {
            info!(job = %job_key, "non-durable job removed; no triggers left");
        }
        Ok(deleted)
    }

    /// Record a finished fire and move its trigger on.
    async fn complete(&self, done: &Completion) -> Result<()> {
        self.store
            .complete_execution(done.fire_id, done.finished_at, &done.outcome)
            .await?;
        if let Some(keep) = self.config.history_limit() {
            let pruned = self.store.prune_executions(&done.job_key, keep).await?;
            if pruned > 0 {
                debug!(job = %done.job_key, pruned, "execution history pruned");
            }
        }

        match &done.outcome {
            Outcome::Success => {
                info!(fire_id = %done.fire_id, job = %done.job_key, "job succeeded")
            }
            Outcome::Failure { error, fatal } => {
                warn!(fire_id = %done.fire_id, job = %done.job_key, fatal, %error, "job failed")
            }
            Outcome::Vetoed { reason } => {
                info!(fire_id = %done.fire_id, job = %done.job_key, %reason, "job vetoed")
            }
        }

        let _settling = self.settle_lock.lock().await;
        // Paused or deleted while running: leave it as the caller set it.
        let Some(mut trigger) = self.store.get_trigger(&done.trigger_key).await? else {
            return Ok(());
        };
        if trigger.state != TriggerState::Executing {
            return Ok(());
        }

        if done.outcome.is_fatal() {
            trigger.state = TriggerState::Error;
            if self
                .store
                .update_trigger_if(&trigger, TriggerState::Executing)
                .await?
            {
                warn!(trigger = %trigger.key, "trigger moved to error after fatal failure");
            }
            return Ok(());
        }
        self.settle(trigger, TriggerState::Executing).await
    }
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Newly claimed by this pass's acquire.
    pub acquired: usize,
    /// Handed to the executor.
    pub fired: usize,
    /// Left `Acquired` for lack of executor capacity.
    pub deferred: usize,
    /// Misfires skipped under `DoNothing`, or triggers changed mid-pass.
    pub skipped: usize,
    /// Moved to `Error` (job missing).
    pub errored: usize,
}

enum Fired {
    Dispatched,
    Deferred,
    Skipped,
    Errored,
}

/// Exponential retry delay for store failures.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// The dispatch loop. Owns the completion channel; everything else lives in
/// [`Shared`] so handles can act on the same store and executor.
pub struct SchedulerEngine {
    shared: Arc<Shared>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    /// Completions whose store update failed; retried before the next acquire.
    pending: VecDeque<Completion>,
    /// Execution records whose insert failed; written before any completion.
    unrecorded: VecDeque<ExecutionRecord>,
    /// Dispatched fires whose completion has not been received yet.
    outstanding: usize,
}

impl SchedulerEngine {
    pub fn new(store: Arc<dyn Store>, registry: PayloadRegistry, config: SchedulerConfig) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    /// Build an engine on an injected clock; tests pass a `ManualClock`.
    pub fn with_clock(
        store: Arc<dyn Store>,
        registry: PayloadRegistry,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let executor = Executor::new(registry, config.worker_pool_size, clock.clone());
        Self {
            shared: Arc::new(Shared {
                store,
                clock,
                executor,
                config,
                wake: Notify::new(),
                settle_lock: Mutex::new(()),
                live: LiveKeys::default(),
                completions_tx,
            }),
            completions_rx,
            pending: VecDeque::new(),
            unrecorded: VecDeque::new(),
            outstanding: 0,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.shared.clone())
    }

    /// Reconcile persisted state after a restart. `run` calls this first;
    /// non-durable definitions registered through this engine's handles
    /// are kept.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recovery::recover(
            self.shared.store.as_ref(),
            self.shared.clock.now(),
            self.shared.config.misfire_threshold(),
            &self.shared.live,
        )
        .await
    }

    /// Main event loop. Runs until `shutdown` broadcasts `true` (or its
    /// sender is dropped), then drains executing jobs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.shared.config.clone();
        info!(instance = %config.instance_id, "scheduler engine started");
        let mut backoff = Backoff::new(config.backoff_initial(), config.backoff_max());

        loop {
            match self.recover().await {
                Ok(report) => {
                    info!(?report, "recovery complete");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(error = %e, retry_in_ms = delay.as_millis() as u64, "recovery failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        res = shutdown.changed() => {
                            if res.is_err() || *shutdown.borrow() {
                                info!("scheduler engine stopped before recovery finished");
                                return;
                            }
                        }
                    }
                }
            }
        }
        backoff.reset();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_pass().await {
                Ok(report) => {
                    backoff.reset();
                    if report != PassReport::default() {
                        debug!(?report, "pass finished");
                    }
                    match self.sleep_for(report).await {
                        Ok(delay) => delay,
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "store unavailable");
                            delay
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if e.is_transient() {
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "pass failed; retrying");
                    } else {
                        error!(error = %e, code = e.code(), retry_in_ms = delay.as_millis() as u64, "pass failed; retrying");
                    }
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shared.wake.notified() => {}
                Some(done) = self.completions_rx.recv() => self.accept(done),
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        info!("scheduler engine stopped");
    }

    /// How long to sleep after a pass: until the earliest waiting fire,
    /// capped by the idle poll, or one tick while triggers are deferred.
    async fn sleep_for(&self, report: PassReport) -> Result<Duration> {
        let config = &self.shared.config;
        let mut delay = config.idle_poll();
        if let Some(earliest) = self.shared.store.earliest_fire_time().await? {
            let until = (earliest - self.shared.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            delay = delay.min(until);
        }
        if report.deferred > 0 || !self.pending.is_empty() || !self.unrecorded.is_empty() {
            delay = delay.min(config.tick());
        }
        Ok(delay)
    }

    fn accept(&mut self, done: Completion) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.pending.push_back(done);
    }

    /// Persist every completion received so far, after any execution
    /// record still unwritten. On a store error the failed item and
    /// everything after it stay queued.
    pub async fn process_completions(&mut self) -> Result<usize> {
        while let Ok(done) = self.completions_rx.try_recv() {
            self.accept(done);
        }
        while let Some(record) = self.unrecorded.front() {
            self.shared.store.insert_execution(record).await?;
            debug!(fire_id = %record.fire_id, "execution record written late");
            self.unrecorded.pop_front();
        }
        let mut processed = 0;
        while let Some(done) = self.pending.front() {
            self.shared.complete(done).await?;
            self.pending.pop_front();
            processed += 1;
        }
        Ok(processed)
    }

    /// Wait for every dispatched fire to finish, then persist the outcomes.
    pub async fn await_completions(&mut self) -> Result<usize> {
        while self.outstanding > 0 {
            match self.completions_rx.recv().await {
                Some(done) => self.accept(done),
                None => break,
            }
        }
        self.process_completions().await
    }

    /// Fires dispatched but not yet reported back.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// One dispatch pass: settle completions, acquire due triggers, then fire
    /// every `Acquired` trigger (fresh and previously deferred) in fire order.
    pub async fn run_pass(&mut self) -> Result<PassReport> {
        self.process_completions().await?;

        let now = self.shared.clock.now();
        let acquired = self
            .shared
            .store
            .acquire_due_triggers(now, self.shared.config.acquire_batch_size)
            .await?;
        let mut report = PassReport {
            acquired: acquired.len(),
            ..PassReport::default()
        };

        let mut triggers = self
            .shared
            .store
            .query_triggers(&TriggerFilter::in_states([TriggerState::Acquired]))
            .await?;
        triggers.sort_by(fire_order);

        for trigger in triggers {
            match self.fire(trigger, now).await? {
                Fired::Dispatched => report.fired += 1,
                Fired::Deferred => report.deferred += 1,
                Fired::Skipped => report.skipped += 1,
                Fired::Errored => report.errored += 1,
            }
        }
        Ok(report)
    }

    async fn fire(&mut self, trigger: Trigger, now: DateTime<Utc>) -> Result<Fired> {
        let shared = self.shared.clone();
        let store = shared.store.as_ref();

        let Some(job) = store.get_job(&trigger.job_key).await? else {
            let mut broken = trigger;
            broken.state = TriggerState::Error;
            if store
                .update_trigger_if(&broken, TriggerState::Acquired)
                .await?
            {
                error!(trigger = %broken.key, job = %broken.job_key, "job missing; trigger moved to error");
            }
            return Ok(Fired::Errored);
        };

        let Some(plan) = misfire::plan(&trigger, now, shared.config.misfire_threshold()) else {
            // Acquired without a next fire: nothing left to run.
            shared.settle(trigger, TriggerState::Acquired).await?;
            return Ok(Fired::Skipped);
        };
        if plan.is_misfire() {
            warn!(
                trigger = %trigger.key,
                scheduled = %trigger.next_fire_time.unwrap_or(now),
                policy = %trigger.misfire_policy,
                "misfire detected"
            );
        }

        let (scheduled, fired_for, next) = match plan {
            FirePlan::Skip { next, .. } => {
                let mut skipped = trigger;
                skipped.next_fire_time = next;
                shared.settle(skipped, TriggerState::Acquired).await?;
                return Ok(Fired::Skipped);
            }
            FirePlan::OnTime { scheduled, next } | FirePlan::CatchUp { scheduled, next } => {
                (scheduled, scheduled, next)
            }
            FirePlan::FireNow { scheduled, next } => (scheduled, now, next),
        };

        let Some(reservation) = shared.executor.try_reserve(&job) else {
            debug!(trigger = %trigger.key, job = %job.key, "executor at capacity; trigger deferred");
            return Ok(Fired::Deferred);
        };

        let mut executing = trigger.clone();
        executing.state = TriggerState::Executing;
        executing.previous_fire_time = Some(fired_for);
        executing.next_fire_time = next;
        executing.times_triggered += 1;
        if !store
            .update_trigger_if(&executing, TriggerState::Acquired)
            .await?
        {
            debug!(trigger = %trigger.key, "trigger changed during pass; not fired");
            return Ok(Fired::Skipped);
        }

        let fire_id = Uuid::new_v4();
        let data = merge_data(&job.data, &trigger.data);
        let record = ExecutionRecord {
            fire_id,
            job_key: job.key.clone(),
            trigger_key: trigger.key.clone(),
            scheduled_fire_time: scheduled,
            fired_at: now,
            finished_at: None,
            outcome: None,
            data: data.clone(),
        };
        if let Err(e) = store.insert_execution(&record).await {
            warn!(fire_id = %fire_id, error = %e, "execution record not written; retrying later");
            self.unrecorded.push_back(record);
        }

        let ctx = JobContext {
            fire_id,
            job_key: job.key.clone(),
            trigger_key: trigger.key.clone(),
            scheduled_fire_time: scheduled,
            fired_at: now,
            previous_fire_time: trigger.previous_fire_time,
            next_fire_time: next,
            data,
            cancel: CancellationToken::new(),
        };
        info!(
            fire_id = %fire_id,
            trigger = %trigger.key,
            job = %job.key,
            scheduled = %scheduled,
            "firing job"
        );
        shared
            .executor
            .dispatch(&job, ctx, reservation, shared.completions_tx.clone());
        self.outstanding += 1;
        Ok(Fired::Dispatched)
    }

    /// Stop accepting work: wait out the grace period, interrupt stragglers,
    /// persist what finished and hand deferred triggers back to `Waiting`.
    async fn drain(&mut self) {
        let config = self.shared.config.clone();
        if self.outstanding > 0 {
            info!(executing = self.outstanding, "waiting for executing jobs");
            self.collect_until(tokio::time::Instant::now() + config.shutdown_grace())
                .await;
        }
        if self.outstanding > 0 {
            warn!(executing = self.outstanding, "grace period over; interrupting jobs");
            self.shared.executor.cancel_all();
            self.collect_until(tokio::time::Instant::now() + config.tick())
                .await;
        }
        if let Err(e) = self.process_completions().await {
            error!(
                error = %e,
                pending = self.pending.len(),
                unrecorded = self.unrecorded.len(),
                "completions lost at shutdown"
            );
        }

        let store = self.shared.store.as_ref();
        match store
            .query_triggers(&TriggerFilter::in_states([TriggerState::Acquired]))
            .await
        {
            Ok(deferred) => {
                for trigger in deferred {
                    if let Err(e) = store
                        .transition_trigger(&trigger.key, TriggerState::Acquired, TriggerState::Waiting)
                        .await
                    {
                        warn!(trigger = %trigger.key, error = %e, "could not release trigger");
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not release acquired triggers"),
        }
    }

    async fn collect_until(&mut self, deadline: tokio::time::Instant) {
        while self.outstanding > 0 {
            match tokio::time::timeout_at(deadline, self.completions_rx.recv()).await {
                Ok(Some(done)) => self.accept(done),
                Ok(None) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
