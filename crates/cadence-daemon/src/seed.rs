//! Declarative `[[jobs]]` seeds from the config file, upserted at startup.
//!
//! ```toml
//! [[jobs]]
//! name = "heartbeat"
//! payload = "log"
//! data = { message = "still alive" }
//!
//! [[jobs.triggers]]
//! name = "every-minute"
//! schedule = { kind = "cron", expression = "0 * * * * ?" }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_scheduler::{
    types::DEFAULT_GROUP, ConcurrencyPolicy, DataValue, Job, JobKey, MisfirePolicy, Schedule,
    SchedulerHandle, Trigger, TriggerKey,
};
use chrono::{DateTime, Utc};
use figment::Figment;
use serde::Deserialize;
use tracing::{debug, info};

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

#[derive(Debug, Deserialize)]
pub struct JobSeed {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub payload: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, DataValue>,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub triggers: Vec<TriggerSeed>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerSeed {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub schedule: ScheduleSeed,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub misfire_threshold_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub data: BTreeMap<String, DataValue>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

/// Like [`Schedule`], but a simple schedule may omit `start` to begin at boot.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSeed {
    Simple {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        interval_ms: u64,
        #[serde(default)]
        repeat_count: Option<u32>,
    },
    Cron {
        expression: String,
        #[serde(default)]
        time_zone: Option<String>,
    },
}

impl JobSeed {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.name, &self.group)
    }

    pub fn job(&self) -> Job {
        let mut job = Job::new(self.key(), &self.payload).with_concurrency(self.concurrency);
        job.description = self.description.clone();
        job.data = self.data.clone();
        job.max_concurrent = self.max_concurrent;
        job.timeout_ms = self.timeout_ms;
        job
    }
}

impl TriggerSeed {
    pub fn key(&self) -> TriggerKey {
        TriggerKey::new(&self.name, &self.group)
    }

    pub fn trigger(&self, job_key: &JobKey, now: DateTime<Utc>) -> Trigger {
        let schedule = match &self.schedule {
            ScheduleSeed::Simple {
                start,
                interval_ms,
                repeat_count,
            } => Schedule::simple(
                start.unwrap_or(now),
                Duration::from_millis(*interval_ms),
                *repeat_count,
            ),
            ScheduleSeed::Cron {
                expression,
                time_zone,
            } => Schedule::cron(expression, time_zone.as_deref().unwrap_or("UTC")),
        };
        let mut trigger = Trigger::new(self.key(), job_key.clone(), schedule)
            .with_misfire_policy(self.misfire_policy);
        trigger.misfire_threshold_ms = self.misfire_threshold_ms;
        if let Some(priority) = self.priority {
            trigger.priority = priority;
        }
        trigger.data = self.data.clone();
        trigger.end_time = self.end_time;
        trigger
    }

    /// Whether `stored` already carries this definition. A simple schedule
    /// without an explicit start matches whatever start it was given.
    fn matches(&self, stored: &Trigger, wanted: &Trigger) -> bool {
        let schedule_matches = match (&self.schedule, &stored.schedule, &wanted.schedule) {
            (
                ScheduleSeed::Simple { start: None, .. },
                Schedule::Simple {
                    interval_ms: a,
                    repeat_count: ra,
                    ..
                },
                Schedule::Simple {
                    interval_ms: b,
                    repeat_count: rb,
                    ..
                },
            ) => a == b && ra == rb,
            _ => stored.schedule == wanted.schedule,
        };
        schedule_matches
            && stored.job_key == wanted.job_key
            && stored.misfire_policy == wanted.misfire_policy
            && stored.misfire_threshold_ms == wanted.misfire_threshold_ms
            && stored.priority == wanted.priority
            && stored.data == wanted.data
            && stored.end_time == wanted.end_time
    }
}

/// Read the `[[jobs]]` array; an absent section means no seeds.
pub fn load(figment: &Figment) -> Result<Vec<JobSeed>> {
    if figment.find_value("jobs").is_err() {
        return Ok(Vec::new());
    }
    figment
        .extract_inner("jobs")
        .context("invalid [[jobs]] section")
}

/// Upsert every seed: jobs are replaced, triggers are created or
/// rescheduled only when their definition changed so fire history
/// and progress survive restarts.
pub async fn apply(handle: &SchedulerHandle, seeds: &[JobSeed], now: DateTime<Utc>) -> Result<()> {
    for seed in seeds {
        let job = seed.job();
        handle
            .add_job(job.clone(), true)
            .await
            .with_context(|| format!("seeding job {}", job.key))?;

        for trigger_seed in &seed.triggers {
            let wanted = trigger_seed.trigger(&job.key, now);
            match handle.get_trigger(&wanted.key).await? {
                Some(stored) if trigger_seed.matches(&stored, &wanted) => {
                    debug!(trigger = %wanted.key, "seeded trigger unchanged");
                }
                Some(_) => {
                    let key = wanted.key.clone();
                    handle
                        .reschedule_trigger(&key, wanted)
                        .await
                        .with_context(|| format!("rescheduling trigger {key}"))?;
                }
                None => {
                    let key = wanted.key.clone();
                    handle
                        .schedule_trigger(wanted)
                        .await
                        .with_context(|| format!("seeding trigger {key}"))?;
                }
            }
        }
        info!(job = %job.key, triggers = seed.triggers.len(), "job seeded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cadence_core::SchedulerConfig;
    use cadence_scheduler::{ManualClock, MemoryStore, SchedulerEngine};
    use chrono::TimeZone;
    use figment::providers::{Format, Toml};

    const SEEDS: &str = r#"
        [database]
        path = "/tmp/unused.db"

        [[jobs]]
        name = "heartbeat"
        payload = "log"
        data = { message = "still alive" }

        [[jobs.triggers]]
        name = "hourly"
        misfire_policy = "do_nothing"
        schedule = { kind = "cron", expression = "0 0 * * * ?" }

        [[jobs.triggers]]
        name = "every-ten"
        priority = 7
        schedule = { kind = "simple", interval_ms = 10000 }
    "#;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap()
    }

    fn handle_at(now: DateTime<Utc>) -> SchedulerHandle {
        let engine = SchedulerEngine::with_clock(
            Arc::new(MemoryStore::new()),
            crate::payloads::builtin(),
            SchedulerConfig::default(),
            Arc::new(ManualClock::new(now)),
        );
        engine.handle()
    }

    #[test]
    fn parses_jobs_section() {
        let seeds = load(&Figment::from(Toml::string(SEEDS))).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].key(), JobKey::named("heartbeat"));
        assert_eq!(seeds[0].triggers.len(), 2);
        assert_eq!(seeds[0].triggers[0].misfire_policy, MisfirePolicy::DoNothing);
    }

    #[test]
    fn missing_section_is_empty() {
        let seeds = load(&Figment::from(Toml::string("[scheduler]\ntick_ms = 5\n"))).unwrap();
        assert!(seeds.is_empty());
    }

    #[tokio::test]
    async fn apply_is_idempotent_across_restarts() {
        let seeds = load(&Figment::from(Toml::string(SEEDS))).unwrap();
        let handle = handle_at(t0());
        apply(&handle, &seeds, t0()).await.unwrap();

        let hourly = handle
            .get_trigger(&TriggerKey::named("hourly"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            hourly.next_fire_time,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap())
        );
        let every_ten = handle
            .get_trigger(&TriggerKey::named("every-ten"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(every_ten.priority, 7);
        assert_eq!(every_ten.next_fire_time, Some(t0()));

        // A later boot leaves the boot-relative simple trigger where it was.
        let later = t0() + chrono::Duration::minutes(5);
        apply(&handle, &seeds, later).await.unwrap();
        let again = handle
            .get_trigger(&TriggerKey::named("every-ten"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.schedule, every_ten.schedule);
        assert_eq!(handle.list_jobs(&Default::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_definition_is_rescheduled() {
        let mut seeds = load(&Figment::from(Toml::string(SEEDS))).unwrap();
        let handle = handle_at(t0());
        apply(&handle, &seeds, t0()).await.unwrap();

        seeds[0].triggers[0].schedule = ScheduleSeed::Cron {
            expression: "0 15 * * * ?".to_string(),
            time_zone: None,
        };
        apply(&handle, &seeds, t0()).await.unwrap();
        let hourly = handle
            .get_trigger(&TriggerKey::named("hourly"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            hourly.next_fire_time,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 45, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn unknown_payload_fails_seeding() {
        let toml = "[[jobs]]\nname = \"x\"\npayload = \"missing\"\n";
        let seeds = load(&Figment::from(Toml::string(toml))).unwrap();
        assert!(apply(&handle_at(t0()), &seeds, t0()).await.is_err());
    }
}
