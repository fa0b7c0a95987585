// Shared fixtures for the engine scenario tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cadence_core::SchedulerConfig;
use cadence_scheduler::{JobContext, JobError, PayloadRegistry};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// Fast timings so run-loop tests finish quickly.
pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        tick_ms: 10,
        idle_poll_ms: 50,
        shutdown_grace_ms: 500,
        backoff_initial_ms: 10,
        backoff_max_ms: 50,
        ..SchedulerConfig::default()
    }
}

/// Scheduled instants seen by the recording payloads, in call order.
#[derive(Clone, Default)]
pub struct Recorder {
    fires: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl Recorder {
    fn record(&self, ctx: &JobContext) {
        self.fires
            .lock()
            .unwrap()
            .push((ctx.trigger_key.name.clone(), ctx.scheduled_fire_time));
    }

    pub fn scheduled(&self) -> Vec<DateTime<Utc>> {
        self.fires.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn triggers(&self) -> Vec<String> {
        self.fires
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.fires.lock().unwrap().len()
    }

    /// Highest number of payloads observed running at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

/// Holds `gated` payloads until permits are added.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn open(&self, runs: usize) {
        self.0.add_permits(runs);
    }
}

/// Payloads: `record`, `gated` (blocks until the gate opens or the fire is
/// cancelled), `overlap` (real sleep, tracks concurrency) and `fatal`.
pub fn registry() -> (PayloadRegistry, Recorder, Gate) {
    let recorder = Recorder::default();
    let gate = Gate(Arc::new(Semaphore::new(0)));
    let mut registry = PayloadRegistry::new();

    let r = recorder.clone();
    registry.register_fn("record", move |ctx: JobContext| {
        let r = r.clone();
        async move {
            r.record(&ctx);
            Ok(())
        }
    });

    let (r, g) = (recorder.clone(), gate.clone());
    registry.register_fn("gated", move |ctx: JobContext| {
        let (r, g) = (r.clone(), g.clone());
        async move {
            r.record(&ctx);
            tokio::select! {
                permit = g.0.acquire() => {
                    permit.map_err(|e| JobError::Failed(e.to_string()))?.forget();
                    Ok(())
                }
                _ = ctx.cancel.cancelled() => Err(JobError::Cancelled),
            }
        }
    });

    let r = recorder.clone();
    registry.register_fn("overlap", move |ctx: JobContext| {
        let r = r.clone();
        async move {
            let now = r.running.fetch_add(1, Ordering::SeqCst) + 1;
            r.max_running.fetch_max(now, Ordering::SeqCst);
            r.record(&ctx);
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
            r.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });

    registry.register_fn("fatal", |_ctx: JobContext| async {
        Err(JobError::Fatal("configuration is broken".into()))
    });

    (registry, recorder, gate)
}
