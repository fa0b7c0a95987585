use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_INSTANCE_ID: &str = "cadence";
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;
pub const DEFAULT_ACQUIRE_BATCH_SIZE: usize = 32;
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000; // a fire later than this is a misfire
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_IDLE_POLL_MS: u64 = 30_000; // re-derive the schedule from the store at least this often
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_HISTORY_LIMIT_PER_JOB: usize = 1_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
///
/// The `[[jobs]]` seed section is not modelled here: it belongs to the daemon,
/// which extracts it from [`figment`] with its own types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for the dispatch loop and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Label written to logs; one active instance per datastore.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Upper bound on payloads running at the same time, across all jobs.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Maximum number of triggers claimed by a single acquire pass.
    #[serde(default = "default_acquire_batch_size")]
    pub acquire_batch_size: usize,
    /// Used for triggers that do not carry their own threshold.
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    /// Scheduler tick: the latency bound for delivering cancellation.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// How long shutdown waits for executing jobs before interrupting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Finished execution records kept per job; older ones are pruned as
    /// fires complete. `0` keeps everything.
    #[serde(default = "default_history_limit_per_job")]
    pub history_limit_per_job: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            acquire_batch_size: DEFAULT_ACQUIRE_BATCH_SIZE,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            tick_ms: DEFAULT_TICK_MS,
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            history_limit_per_job: DEFAULT_HISTORY_LIMIT_PER_JOB,
        }
    }
}

impl SchedulerConfig {
    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Records to keep per job, or `None` when history is unbounded.
    pub fn history_limit(&self) -> Option<usize> {
        (self.history_limit_per_job > 0).then_some(self.history_limit_per_job)
    }

    /// Reject values that would stall the engine (zero-sized pools, zero tick).
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.worker_pool_size == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.acquire_batch_size == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.acquire_batch_size must be at least 1".to_string(),
            ));
        }
        if self.tick_ms == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.tick_ms must be greater than zero".to_string(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(crate::error::CoreError::Config(
                "scheduler.backoff_initial_ms exceeds backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_instance_id() -> String {
    DEFAULT_INSTANCE_ID.to_string()
}
fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}
fn default_acquire_batch_size() -> usize {
    DEFAULT_ACQUIRE_BATCH_SIZE
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_idle_poll_ms() -> u64 {
    DEFAULT_IDLE_POLL_MS
}
fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}
fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}
fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}
fn default_history_limit_per_job() -> usize {
    DEFAULT_HISTORY_LIMIT_PER_JOB
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

/// Build the layered provider stack: TOML file, then CADENCE_* env vars.
///
/// Nested keys use a double underscore so snake_case field names survive,
/// e.g. `CADENCE_SCHEDULER__WORKER_POOL_SIZE=4`.
pub fn figment(config_path: Option<&str>) -> Figment {
    let path = config_path
        .map(String::from)
        .unwrap_or_else(default_config_path);

    Figment::new()
        .merge(Toml::file(&path))
        .merge(Env::prefixed("CADENCE_").split("__"))
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let config: CadenceConfig = figment(config_path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;
        config.scheduler.validate()?;
        debug!(db = %config.database.path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
