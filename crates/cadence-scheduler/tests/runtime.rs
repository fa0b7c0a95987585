// The real run loop on wall-clock time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cadence_scheduler::{
    ExecutionFilter, Job, JobKey, MemoryStore, Outcome, Schedule, SchedulerEngine,
    SchedulerHandle, SqliteStore, Store, Trigger, TriggerKey, TriggerState,
};
use chrono::Utc;
use common::{config, registry};
use tokio::sync::watch;

async fn wait_for_state(handle: &SchedulerHandle, key: &TriggerKey, state: TriggerState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = handle.get_trigger(key).await.ok().flatten().map(|t| t.state);
        if current == Some(state) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "trigger {key} stuck in {current:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn run_loop_fires_a_repeating_trigger_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("cadence.db")).unwrap());
    let (reg, recorder, _gate) = registry();
    let engine = SchedulerEngine::new(store.clone(), reg, config());
    let handle = engine.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(shutdown_rx));

    let job = Job::new(JobKey::named("tick"), "record");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(
            Utc::now() + chrono::Duration::milliseconds(50),
            Duration::from_millis(40),
            Some(2),
        ),
    );
    handle.schedule_job(job, trigger).await.unwrap();

    wait_for_state(&handle, &TriggerKey::named("t"), TriggerState::Complete).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(recorder.count(), 3);
    let history = store
        .query_executions(&ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.outcome == Some(Outcome::Success)));
}

#[tokio::test]
async fn non_durable_job_registered_before_run_still_fires() {
    let store = Arc::new(MemoryStore::new());
    let (reg, recorder, _gate) = registry();
    let engine = SchedulerEngine::new(store.clone(), reg, config());
    let handle = engine.handle();

    let job = Job::new(JobKey::named("once"), "record").with_durable(false);
    let trigger = Trigger::new(
        TriggerKey::named("soon"),
        job.key.clone(),
        Schedule::once(Utc::now() + chrono::Duration::milliseconds(50)),
    )
    .with_durable(false);
    handle.schedule_job(job, trigger).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(shutdown_rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while recorder.count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "trigger never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(recorder.count(), 1);
    assert!(handle.get_job(&JobKey::named("once")).await.unwrap().is_none());
}

#[tokio::test]
async fn run_loop_retries_until_the_store_is_back() {
    let store = Arc::new(MemoryStore::new());
    let (reg, recorder, _gate) = registry();
    let engine = SchedulerEngine::new(store.clone(), reg, config());
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let trigger = Trigger::new(TriggerKey::named("t"), job.key.clone(), Schedule::once(Utc::now()));
    handle.schedule_job(job, trigger).await.unwrap();

    store.set_unavailable(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), 0);

    store.set_unavailable(false);
    wait_for_state(&handle, &TriggerKey::named("t"), TriggerState::Complete).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn shutdown_interrupts_jobs_that_outlive_the_grace_period() {
    let store = Arc::new(MemoryStore::new());
    let (reg, recorder, _gate) = registry();
    let engine = SchedulerEngine::new(store.clone(), reg, config());
    let handle = engine.handle();

    let job = Job::new(JobKey::named("stuck"), "gated");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(Utc::now(), Duration::from_secs(3_600), None),
    );
    handle.schedule_job(job, trigger).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(shutdown_rx));
    wait_for_state(&handle, &TriggerKey::named("t"), TriggerState::Executing).await;
    assert_eq!(recorder.count(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    let history = store
        .query_executions(&ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(history[0].outcome, Some(Outcome::failure("interrupted")));
    let t = store.get_trigger(&TriggerKey::named("t")).await.unwrap().unwrap();
    assert_eq!(t.state, TriggerState::Waiting);
    assert!(handle.executing_jobs().is_empty());
}
