use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::Schedule;

pub const DEFAULT_GROUP: &str = "DEFAULT";
pub const DEFAULT_PRIORITY: i32 = 5;

/// Identity of a job: `(name, group)`, unique together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    /// Key in the default group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identity of a trigger: `(name, group)`, unique together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// A primitive value in a job data map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl DataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Bool(b) => write!(f, "{b}"),
            DataValue::Int(i) => write!(f, "{i}"),
            DataValue::Float(x) => write!(f, "{x}"),
            DataValue::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::String(s.to_string())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::String(s)
    }
}

impl From<i64> for DataValue {
    fn from(i: i64) -> Self {
        DataValue::Int(i)
    }
}

impl From<i32> for DataValue {
    fn from(i: i32) -> Self {
        DataValue::Int(i as i64)
    }
}

impl From<f64> for DataValue {
    fn from(x: f64) -> Self {
        DataValue::Float(x)
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Bool(b)
    }
}

/// String keys to primitive values, handed to the payload at run time.
pub type JobData = BTreeMap<String, DataValue>;

/// Merge trigger-level data over job-level data; trigger keys win.
pub fn merge_data(job: &JobData, trigger: &JobData) -> JobData {
    let mut merged = job.clone();
    merged.extend(trigger.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Whether instances of a job may run at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// No two instances of the job run simultaneously.
    #[default]
    DisallowConcurrent,
    AllowConcurrent,
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConcurrencyPolicy::DisallowConcurrent => "disallow_concurrent",
            ConcurrencyPolicy::AllowConcurrent => "allow_concurrent",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConcurrencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disallow_concurrent" => Ok(ConcurrencyPolicy::DisallowConcurrent),
            "allow_concurrent" => Ok(ConcurrencyPolicy::AllowConcurrent),
            other => Err(format!("unknown concurrency policy: {other}")),
        }
    }
}

/// A registered unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name under which the executable unit is registered in the payload registry.
    pub payload: String,
    #[serde(default)]
    pub data: JobData,
    /// Non-durable jobs do not survive a restart: recovery discards them.
    #[serde(default = "bool_true")]
    pub durable: bool,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    /// Cap for `AllowConcurrent` jobs; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    /// Maximum run duration before the executor cancels the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn bool_true() -> bool {
    true
}

impl Job {
    pub fn new(key: JobKey, payload: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            payload: payload.into(),
            data: JobData::new(),
            durable: true,
            concurrency: ConcurrencyPolicy::default(),
            max_concurrent: None,
            timeout_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Per-job concurrency limit; `None` means unbounded.
    pub fn concurrency_limit(&self) -> Option<usize> {
        match self.concurrency {
            ConcurrencyPolicy::DisallowConcurrent => Some(1),
            ConcurrencyPolicy::AllowConcurrent => self.max_concurrent.map(|m| m as usize),
        }
    }
}

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its next_fire_time.
    Waiting,
    /// Claimed by the dispatch loop for firing.
    Acquired,
    /// Its job is running for the most recent fire.
    Executing,
    Paused,
    /// No more fires.
    Complete,
    /// Excluded from acquisition until explicitly resumed.
    Error,
}

impl TriggerState {
    /// Acquired or executing: at most one such row per trigger.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TriggerState::Acquired | TriggerState::Executing)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Paused => "paused",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "executing" => Ok(TriggerState::Executing),
            "paused" => Ok(TriggerState::Paused),
            "complete" => Ok(TriggerState::Complete),
            "error" => Ok(TriggerState::Error),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// What to do with a fire that was missed by more than the misfire threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once immediately, then continue the schedule from now.
    #[default]
    FireNow,
    /// Fire for the original instant as if on schedule (missed fires catch up).
    IgnoreMisfires,
    /// Skip the missed fire(s) and continue the schedule from now.
    DoNothing,
}

impl fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MisfirePolicy::FireNow => "fire_now",
            MisfirePolicy::IgnoreMisfires => "ignore_misfires",
            MisfirePolicy::DoNothing => "do_nothing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fire_now" => Ok(MisfirePolicy::FireNow),
            "ignore_misfires" => Ok(MisfirePolicy::IgnoreMisfires),
            "do_nothing" => Ok(MisfirePolicy::DoNothing),
            other => Err(format!("unknown misfire policy: {other}")),
        }
    }
}

/// A schedule binding that determines when a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule: Schedule,
    #[serde(default = "default_state")]
    pub state: TriggerState,
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    /// Falls back to the engine-wide threshold when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_threshold_ms: Option<u64>,
    /// Higher fires first when next_fire_time ties.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Merged over the job's data at fire time.
    #[serde(default)]
    pub data: JobData,
    /// No fires are produced after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_triggered: u64,
    /// Non-durable triggers are deleted on completion and discarded by recovery.
    #[serde(default = "bool_true")]
    pub durable: bool,
}

fn default_state() -> TriggerState {
    TriggerState::Waiting
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            schedule,
            state: TriggerState::Waiting,
            next_fire_time: None,
            previous_fire_time: None,
            misfire_policy: MisfirePolicy::default(),
            misfire_threshold_ms: None,
            priority: DEFAULT_PRIORITY,
            data: JobData::new(),
            end_time: None,
            times_triggered: 0,
            durable: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold_ms = Some(threshold.as_millis() as u64);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn misfire_threshold(&self, default: Duration) -> Duration {
        self.misfire_threshold_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

/// Acquisition order: earliest next_fire_time, then highest priority, then key.
pub fn fire_order(a: &Trigger, b: &Trigger) -> Ordering {
    match (a.next_fire_time, b.next_fire_time) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| b.priority.cmp(&a.priority))
    .then_with(|| a.key.cmp(&b.key))
}

/// Result of one execution, as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// `fatal` failures move the trigger to `Error`.
    Failure { error: String, fatal: bool },
    Vetoed { reason: String },
}

impl Outcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Outcome::Failure {
            error: error.into(),
            fatal: false,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Outcome::Failure {
            error: error.into(),
            fatal: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Failure { fatal: true, .. })
    }
}

/// One row of execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub fire_id: Uuid,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    /// The schedule instant this execution stands for.
    pub scheduled_fire_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    /// `None` while the job is still running.
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    /// Snapshot of the merged data the payload received.
    #[serde(default)]
    pub data: JobData,
}

impl ExecutionRecord {
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.fired_at)
    }
}

/// Aggregate state of a job across its triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// At least one instance is running.
    Executing,
    /// At least one trigger will fire.
    Scheduled,
    Paused,
    Error,
    /// Every trigger has completed.
    Complete,
    /// No triggers reference the job.
    Unscheduled,
}

/// Answer to a job status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_key: JobKey,
    pub current_state: JobState,
    /// Earliest upcoming fire across the job's active triggers.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Outcome of the most recently finished execution.
    pub last_result: Option<Outcome>,
    pub last_fired_at: Option<DateTime<Utc>>,
}
