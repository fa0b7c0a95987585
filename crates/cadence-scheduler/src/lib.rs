//! `cadence-scheduler`: persistent job scheduler with pluggable storage.
//!
//! # Overview
//!
//! Jobs (what to run) and triggers (when to run it) live in a [`Store`].
//! The [`SchedulerEngine`] dispatch loop sleeps until the earliest waiting
//! fire time, atomically acquires due triggers, applies misfire policy and
//! hands jobs to the [`Executor`], which enforces the worker pool and
//! per-job concurrency. On startup [`recovery`] repairs whatever a crashed
//! process left in flight. [`SchedulerHandle`] is the management API.
//!
//! # Schedule variants
//!
//! | Variant  | Behaviour                                                  |
//! |----------|------------------------------------------------------------|
//! | `Simple` | `start + n * interval`, optionally bounded by a repeat count |
//! | `Cron`   | 5/6/7-field cron expression in an IANA time zone           |
//!
//! # Trigger lifecycle
//!
//! `Waiting → Acquired → Executing → Waiting`, ending in `Complete` or
//! `Error`; `Waiting ⇄ Paused` on request.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod misfire;
pub mod recovery;
pub mod schedule;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{PassReport, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use executor::{
    Completion, Executor, JobContext, JobError, Payload, PayloadRegistry, RunningFire,
};
pub use handle::{SchedulerHandle, TriggerHandle};
pub use recovery::{LiveKeys, RecoveryReport};
pub use schedule::Schedule;
pub use store::{ExecutionFilter, JobFilter, MemoryStore, SqliteStore, Store, TriggerFilter};
pub use types::{
    ConcurrencyPolicy, DataValue, ExecutionRecord, Job, JobData, JobKey, JobState, JobStatus,
    MisfirePolicy, Outcome, Trigger, TriggerKey, TriggerState,
};
