//! Executor: runs payloads under the worker pool and per-job concurrency limits.
//!
//! The dispatch loop asks for a [`Reservation`] first (`try_reserve` never
//! blocks), then hands the reservation to [`Executor::dispatch`], which spawns
//! the payload and reports a [`Completion`] back over an mpsc channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    types::{Job, JobData, JobKey, Outcome, TriggerKey},
};

/// How long a timed-out payload gets to observe its cancelled token before
/// its task is aborted.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Error returned by a payload run.
#[derive(Debug, Error)]
pub enum JobError {
    /// Recoverable; the trigger keeps its schedule.
    #[error("{0}")]
    Failed(String),

    /// Unrecoverable; the trigger moves to `Error`.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The payload declined to run this fire.
    #[error("vetoed: {0}")]
    Vetoed(String),

    /// The payload stopped because its cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

impl From<JobError> for Outcome {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Failed(msg) => Outcome::failure(msg),
            JobError::Fatal(msg) => Outcome::fatal(msg),
            JobError::Vetoed(reason) => Outcome::Vetoed { reason },
            JobError::Cancelled => Outcome::failure("interrupted"),
        }
    }
}

/// Everything a payload knows about the fire it is serving.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub fire_id: Uuid,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Job data with trigger data merged over it.
    pub data: JobData,
    /// Cancelled on interrupt, timeout or shutdown. Long-running payloads
    /// should select on `cancel.cancelled()`.
    pub cancel: CancellationToken,
}

/// An executable unit, registered by name.
#[async_trait]
pub trait Payload: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError>;
}

/// Adapter so plain async closures can be registered as payloads.
pub struct FnPayload<F>(pub F);

#[async_trait]
impl<F, Fut> Payload for FnPayload<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.0)(ctx).await
    }
}

/// Payloads by name. Cloning shares the registered payloads.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    payloads: HashMap<String, Arc<dyn Payload>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, payload: Arc<dyn Payload>) {
        self.payloads.insert(name.into(), payload);
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnPayload(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Payload>> {
        self.payloads.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.payloads.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.payloads.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Capacity claimed for one fire: a worker slot plus, for limited jobs, a
/// per-job slot. Dropping it releases both.
#[derive(Debug)]
pub struct Reservation {
    _worker: OwnedSemaphorePermit,
    _job: Option<OwnedSemaphorePermit>,
}

/// Sent to the dispatch loop when a fire finishes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub fire_id: Uuid,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
}

/// A fire currently running on the executor.
#[derive(Debug, Clone, Serialize)]
pub struct RunningFire {
    pub fire_id: Uuid,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
}

struct JobSlot {
    limit: usize,
    permits: Arc<Semaphore>,
}

pub struct Executor {
    registry: PayloadRegistry,
    workers: Arc<Semaphore>,
    job_slots: DashMap<JobKey, JobSlot>,
    running: Arc<DashMap<Uuid, RunningFire>>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(registry: PayloadRegistry, worker_pool_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            workers: Arc::new(Semaphore::new(worker_pool_size)),
            job_slots: DashMap::new(),
            running: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    /// Claim capacity for one run of `job` without waiting. `None` means the
    /// pool is full or the job is at its concurrency limit.
    pub fn try_reserve(&self, job: &Job) -> Option<Reservation> {
        let job_permit = match job.concurrency_limit() {
            Some(limit) => Some(self.job_semaphore(&job.key, limit).try_acquire_owned().ok()?),
            None => None,
        };
        let worker = self.workers.clone().try_acquire_owned().ok()?;
        Some(Reservation {
            _worker: worker,
            _job: job_permit,
        })
    }

    fn job_semaphore(&self, key: &JobKey, limit: usize) -> Arc<Semaphore> {
        let mut slot = self.job_slots.entry(key.clone()).or_insert_with(|| JobSlot {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
        });
        // A changed limit only takes effect once no run holds the old one.
        if slot.limit != limit && slot.permits.available_permits() == slot.limit {
            *slot = JobSlot {
                limit,
                permits: Arc::new(Semaphore::new(limit)),
            };
        }
        slot.permits.clone()
    }

    /// Spawn the payload for `ctx` and report its outcome on `completions`.
    pub fn dispatch(
        &self,
        job: &Job,
        ctx: JobContext,
        reservation: Reservation,
        completions: mpsc::UnboundedSender<Completion>,
    ) {
        let fire_id = ctx.fire_id;
        let job_key = ctx.job_key.clone();
        let trigger_key = ctx.trigger_key.clone();
        self.running.insert(
            fire_id,
            RunningFire {
                fire_id,
                job_key: job_key.clone(),
                trigger_key: trigger_key.clone(),
                scheduled_fire_time: ctx.scheduled_fire_time,
                fired_at: ctx.fired_at,
                cancel: ctx.cancel.clone(),
            },
        );

        let payload = self.registry.get(&job.payload);
        let payload_name = job.payload.clone();
        let timeout = job.timeout();
        let running = self.running.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let outcome = match payload {
                Some(payload) => run(payload, ctx, timeout).await,
                None => Outcome::fatal(format!("no payload registered as '{payload_name}'")),
            };
            running.remove(&fire_id);
            drop(reservation);

            debug!(fire_id = %fire_id, job = %job_key, ?outcome, "fire finished");
            let completion = Completion {
                fire_id,
                job_key,
                trigger_key,
                outcome,
                finished_at: clock.now(),
            };
            if completions.send(completion).is_err() {
                warn!(fire_id = %fire_id, "completion channel closed; outcome not recorded");
            }
        });
    }

    /// Fires currently running, oldest first.
    pub fn executing(&self) -> Vec<RunningFire> {
        let mut fires: Vec<RunningFire> = self.running.iter().map(|r| r.value().clone()).collect();
        fires.sort_by_key(|f| f.fired_at);
        fires
    }

    /// Whether a fire of `trigger` has not finished yet.
    pub fn is_running_trigger(&self, trigger: &TriggerKey) -> bool {
        self.running.iter().any(|f| f.trigger_key == *trigger)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Cancel every running instance of `job`. Returns how many were signalled.
    pub fn interrupt_job(&self, job: &JobKey) -> usize {
        let mut n = 0;
        for fire in self.running.iter().filter(|f| f.job_key == *job) {
            fire.cancel.cancel();
            n += 1;
        }
        n
    }

    pub fn cancel_all(&self) {
        for fire in self.running.iter() {
            fire.cancel.cancel();
        }
    }
}

/// Run one payload to an [`Outcome`]. The payload gets its own task so a
/// panic is contained; `timeout` cancels the token and records a failure.
pub async fn run(payload: Arc<dyn Payload>, ctx: JobContext, timeout: Option<Duration>) -> Outcome {
    let cancel = ctx.cancel.clone();
    let mut handle = tokio::spawn(async move { payload.run(ctx).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                }
                return Outcome::failure(format!("timed out after {}ms", limit.as_millis()));
            }
        },
        None => (&mut handle).await,
    };

    match joined {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(e)) => e.into(),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Outcome::failure(format!("payload panicked: {msg}"))
        }
        Err(_) => Outcome::failure("payload task aborted"),
    }
}
