// Dispatch-loop scenarios driven pass by pass on virtual time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use cadence_scheduler::{
    ConcurrencyPolicy, ExecutionFilter, Job, JobKey, JobState, ManualClock, MemoryStore,
    MisfirePolicy, Outcome, PassReport, Schedule, SchedulerEngine, Store, Trigger, TriggerKey,
    TriggerState,
};
use common::{config, registry, secs, t0, Recorder};

fn engine_at(store: Arc<MemoryStore>, clock: &ManualClock) -> (SchedulerEngine, Recorder, common::Gate) {
    let (registry, recorder, gate) = registry();
    let engine = SchedulerEngine::with_clock(store, registry, config(), Arc::new(clock.clone()));
    (engine, recorder, gate)
}

/// One pass followed by waiting for whatever it dispatched.
async fn step(engine: &mut SchedulerEngine) -> PassReport {
    let report = engine.run_pass().await.unwrap();
    engine.await_completions().await.unwrap();
    report
}

#[tokio::test]
async fn simple_trigger_fires_three_times_then_completes() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("report"), "record");
    let trigger = Trigger::new(
        TriggerKey::named("every-10s"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), Some(2)),
    );
    let th = handle.schedule_job(job, trigger).await.unwrap();

    for _ in 0..4 {
        step(&mut engine).await;
        clock.advance(secs(10));
    }

    assert_eq!(recorder.scheduled(), [t0(), t0() + secs(10), t0() + secs(20)]);
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Complete));
    let t = handle.get_trigger(th.key()).await.unwrap().unwrap();
    assert_eq!(t.times_triggered, 3);
    assert_eq!(t.previous_fire_time, Some(t0() + secs(20)));

    let status = handle.get_job_status(&JobKey::named("report")).await.unwrap();
    assert_eq!(status.current_state, JobState::Complete);
    assert_eq!(status.last_result, Some(Outcome::Success));
    assert_eq!(status.next_fire_time, None);
}

#[tokio::test]
async fn hourly_cron_skips_missed_hours_under_do_nothing() {
    let start = t0() + secs(30 * 60);
    let clock = ManualClock::new(start);
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("hourly"), "record");
    let trigger = Trigger::new(
        TriggerKey::named("top-of-hour"),
        job.key.clone(),
        Schedule::cron("0 0 * * * ?", "UTC"),
    )
    .with_misfire_policy(MisfirePolicy::DoNothing);
    let th = handle.schedule_job(job, trigger).await.unwrap();
    assert_eq!(th.next_fire_time().await.unwrap(), Some(t0() + secs(3_600)));

    // 01:00 is the first fire; jump three hours past it.
    clock.set(t0() + secs(4 * 3_600 + 30));
    let report = step(&mut engine).await;

    assert_eq!(report.fired, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(recorder.count(), 0);
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Waiting));
    assert_eq!(th.next_fire_time().await.unwrap(), Some(t0() + secs(5 * 3_600)));

    clock.set(t0() + secs(5 * 3_600));
    step(&mut engine).await;
    assert_eq!(recorder.scheduled(), [t0() + secs(5 * 3_600)]);
}

#[tokio::test]
async fn fire_now_misfire_fires_once_and_continues_from_now() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), None),
    );
    let th = handle.schedule_job(job, trigger).await.unwrap();

    clock.set(t0() + secs(125));
    step(&mut engine).await;

    assert_eq!(recorder.count(), 1);
    let t = handle.get_trigger(th.key()).await.unwrap().unwrap();
    assert_eq!(t.previous_fire_time, Some(t0() + secs(125)));
    assert_eq!(t.next_fire_time, Some(t0() + secs(130)));
}

#[tokio::test]
async fn ignore_misfires_catches_up_one_instant_per_pass() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(60), Some(3)),
    )
    .with_misfire_policy(MisfirePolicy::IgnoreMisfires);
    handle.schedule_job(job, trigger).await.unwrap();

    clock.set(t0() + secs(600));
    for _ in 0..5 {
        step(&mut engine).await;
    }
    assert_eq!(
        recorder.scheduled(),
        [t0(), t0() + secs(60), t0() + secs(120), t0() + secs(180)]
    );
}

#[tokio::test]
async fn second_trigger_on_busy_job_is_deferred() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("exclusive"), "gated");
    let first = Trigger::new(TriggerKey::named("a"), job.key.clone(), Schedule::once(t0()))
        .with_priority(9);
    let second = Trigger::new(TriggerKey::named("b"), job.key.clone(), Schedule::once(t0()));
    handle.schedule_job(job, first).await.unwrap();
    handle.schedule_trigger(second).await.unwrap();

    let report = engine.run_pass().await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(handle.executing_jobs().len(), 1);
    let b = handle.get_trigger(&TriggerKey::named("b")).await.unwrap().unwrap();
    assert_eq!(b.state, TriggerState::Acquired);

    // Still running: the deferred trigger stays put.
    let report = engine.run_pass().await.unwrap();
    assert_eq!(report.deferred, 1);

    gate.open(1);
    engine.await_completions().await.unwrap();
    let report = engine.run_pass().await.unwrap();
    assert_eq!(report.fired, 1);

    gate.open(1);
    engine.await_completions().await.unwrap();
    engine.process_completions().await.unwrap();
    assert_eq!(recorder.triggers(), ["a", "b"]);
    for name in ["a", "b"] {
        let t = handle.get_trigger(&TriggerKey::named(name)).await.unwrap().unwrap();
        assert_eq!(t.state, TriggerState::Complete);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disallow_concurrent_never_overlaps() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("exclusive"), "overlap");
    handle.add_job(job.clone(), false).await.unwrap();
    for name in ["a", "b", "c"] {
        let t = Trigger::new(
            TriggerKey::named(name),
            job.key.clone(),
            Schedule::simple(t0(), Duration::from_secs(1), Some(4)),
        );
        handle.schedule_trigger(t).await.unwrap();
    }

    for _ in 0..40 {
        engine.run_pass().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        clock.advance(chrono::Duration::milliseconds(500));
    }
    engine.await_completions().await.unwrap();

    assert!(recorder.count() > 3, "only {} fires", recorder.count());
    assert_eq!(recorder.max_running(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allow_concurrent_respects_its_cap() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("parallel"), "overlap")
        .with_concurrency(ConcurrencyPolicy::AllowConcurrent)
        .with_max_concurrent(2);
    handle.add_job(job.clone(), false).await.unwrap();
    for name in ["a", "b", "c", "d"] {
        let t = Trigger::new(TriggerKey::named(name), job.key.clone(), Schedule::once(t0()));
        handle.schedule_trigger(t).await.unwrap();
    }

    let report = engine.run_pass().await.unwrap();
    assert_eq!(report.fired, 2);
    assert_eq!(report.deferred, 2);
    engine.await_completions().await.unwrap();
    step(&mut engine).await;

    assert_eq!(recorder.count(), 4);
    assert!(recorder.max_running() <= 2);
}

#[tokio::test]
async fn fatal_failure_moves_trigger_to_error_until_resumed() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, _recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("broken"), "fatal");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), None),
    );
    let th = handle.schedule_job(job, trigger).await.unwrap();

    step(&mut engine).await;
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Error));
    let status = handle.get_job_status(&JobKey::named("broken")).await.unwrap();
    assert_eq!(status.current_state, JobState::Error);
    assert!(status.last_result.unwrap().is_fatal());

    // Errored triggers are not acquired.
    clock.advance(secs(10));
    assert_eq!(step(&mut engine).await.acquired, 0);

    th.resume().await.unwrap();
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Waiting));
    assert_eq!(th.next_fire_time().await.unwrap(), Some(t0() + secs(10)));
}

#[tokio::test]
async fn paused_trigger_is_not_acquired() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), None),
    );
    let th = handle.schedule_job(job, trigger).await.unwrap();
    handle.pause_job(&JobKey::named("j")).await.unwrap();
    assert_eq!(
        handle.get_job_status(&JobKey::named("j")).await.unwrap().current_state,
        JobState::Paused
    );

    step(&mut engine).await;
    assert_eq!(recorder.count(), 0);

    th.resume().await.unwrap();
    step(&mut engine).await;
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn pausing_an_executing_trigger_survives_its_completion() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, _recorder, gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "gated");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), None),
    );
    let th = handle.schedule_job(job, trigger).await.unwrap();

    engine.run_pass().await.unwrap();
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Executing));
    th.pause().await.unwrap();

    gate.open(1);
    engine.await_completions().await.unwrap();
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Paused));
}

#[tokio::test]
async fn resuming_mid_fire_waits_for_the_running_fire() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "gated")
        .with_concurrency(ConcurrencyPolicy::AllowConcurrent);
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), None),
    );
    let th = handle.schedule_job(job, trigger).await.unwrap();

    assert_eq!(engine.run_pass().await.unwrap().fired, 1);
    th.pause().await.unwrap();
    th.resume().await.unwrap();
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Executing));

    // The t0 fire is still running, so t10 waits for it.
    clock.advance(secs(10));
    assert_eq!(engine.run_pass().await.unwrap().fired, 0);
    assert_eq!(handle.executing_jobs().len(), 1);

    gate.open(1);
    engine.await_completions().await.unwrap();
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Waiting));
    assert_eq!(th.next_fire_time().await.unwrap(), Some(t0() + secs(10)));

    assert_eq!(engine.run_pass().await.unwrap().fired, 1);
    assert_eq!(handle.executing_jobs().len(), 1);

    gate.open(1);
    engine.await_completions().await.unwrap();
    assert_eq!(recorder.scheduled(), [t0(), t0() + secs(10)]);
}

#[tokio::test]
async fn resuming_after_the_fire_finished_returns_to_waiting() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, _recorder, gate) = engine_at(store.clone(), &clock);

    let job = Job::new(JobKey::named("j"), "gated");
    let trigger = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), None),
    );
    let th = engine.handle().schedule_job(job, trigger).await.unwrap();

    engine.run_pass().await.unwrap();
    th.pause().await.unwrap();
    gate.open(1);
    engine.await_completions().await.unwrap();

    th.resume().await.unwrap();
    assert_eq!(th.state().await.unwrap(), Some(TriggerState::Waiting));
    assert_eq!(th.next_fire_time().await.unwrap(), Some(t0() + secs(10)));
}

#[tokio::test]
async fn interrupt_cancels_running_fire() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, _recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "gated");
    let trigger = Trigger::new(TriggerKey::named("t"), job.key.clone(), Schedule::once(t0()));
    handle.schedule_job(job, trigger).await.unwrap();

    engine.run_pass().await.unwrap();
    assert_eq!(handle.interrupt_job(&JobKey::named("j")), 1);
    engine.await_completions().await.unwrap();

    let history = handle
        .execution_history(&ExecutionFilter::for_job(&JobKey::named("j")))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, Some(Outcome::failure("interrupted")));
    assert!(handle.executing_jobs().is_empty());
}

#[tokio::test]
async fn non_durable_trigger_and_job_are_removed_on_completion() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, _recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("once"), "record").with_durable(false);
    let trigger = Trigger::new(TriggerKey::named("t"), job.key.clone(), Schedule::once(t0()))
        .with_durable(false);
    handle.schedule_job(job, trigger).await.unwrap();

    step(&mut engine).await;
    assert!(handle.get_trigger(&TriggerKey::named("t")).await.unwrap().is_none());
    assert!(handle.get_job(&JobKey::named("once")).await.unwrap().is_none());
    // History outlives both.
    assert_eq!(
        handle
            .execution_history(&ExecutionFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn invalid_definitions_are_never_persisted() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (engine, _recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let bad_cron = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::cron("not a cron", "UTC"),
    );
    let err = handle.schedule_job(job.clone(), bad_cron).await.unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION_ERROR");

    let bad_zone = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::cron("0 0 * * * ?", "Mars/Olympus"),
    );
    assert!(handle.schedule_job(job, bad_zone).await.is_err());

    let unknown = Job::new(JobKey::named("k"), "no-such-payload");
    let t = Trigger::new(TriggerKey::named("u"), unknown.key.clone(), Schedule::once(t0()));
    assert_eq!(
        handle.schedule_job(unknown, t).await.unwrap_err().code(),
        "CONFIGURATION_ERROR"
    );

    assert!(store.query_jobs(&Default::default()).await.unwrap().is_empty());
    assert!(store.query_triggers(&Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_job_key_is_rejected_and_rolled_back() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (engine, _recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let t1 = Trigger::new(TriggerKey::named("t1"), job.key.clone(), Schedule::once(t0()));
    handle.schedule_job(job.clone(), t1).await.unwrap();

    let t2 = Trigger::new(TriggerKey::named("t2"), job.key.clone(), Schedule::once(t0()));
    let err = handle.schedule_job(job, t2).await.unwrap_err();
    assert_eq!(err.code(), "JOB_EXISTS");
    assert!(handle.get_trigger(&TriggerKey::named("t2")).await.unwrap().is_none());

    let dup = Trigger::new(TriggerKey::named("t1"), JobKey::named("j"), Schedule::once(t0()));
    assert_eq!(
        handle.schedule_trigger(dup).await.unwrap_err().code(),
        "TRIGGER_EXISTS"
    );
}

#[tokio::test]
async fn deleting_a_job_removes_its_triggers() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (engine, _recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::new("j", "reports"), "record");
    let t = Trigger::new(TriggerKey::new("t", "reports"), job.key.clone(), Schedule::once(t0()));
    handle.schedule_job(job, t).await.unwrap();
    assert_eq!(handle.job_groups().await.unwrap(), ["reports"]);

    assert!(handle.delete_job(&JobKey::new("j", "reports")).await.unwrap());
    assert!(handle.trigger_groups().await.unwrap().is_empty());
    assert_eq!(
        handle.get_job_status(&JobKey::new("j", "reports")).await.unwrap_err().code(),
        "JOB_NOT_FOUND"
    );
}

#[tokio::test]
async fn execution_record_is_written_once_the_store_accepts_it() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let t = Trigger::new(TriggerKey::named("t"), job.key.clone(), Schedule::once(t0()));
    handle.schedule_job(job, t).await.unwrap();

    store.fail_next_inserts(1);
    assert_eq!(engine.run_pass().await.unwrap().fired, 1);
    let history = ExecutionFilter::for_job(&JobKey::named("j"));
    assert!(handle.execution_history(&history).await.unwrap().is_empty());

    engine.await_completions().await.unwrap();
    let records = handle.execution_history(&history).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].scheduled_fire_time, t0());
    assert_eq!(records[0].outcome, Some(Outcome::Success));
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn history_is_pruned_to_the_configured_limit() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (registry, _recorder, _gate) = registry();
    let config = SchedulerConfig {
        history_limit_per_job: 2,
        ..config()
    };
    let mut engine =
        SchedulerEngine::with_clock(store.clone(), registry, config, Arc::new(clock.clone()));
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let t = Trigger::new(
        TriggerKey::named("t"),
        job.key.clone(),
        Schedule::simple(t0(), Duration::from_secs(10), Some(2)),
    );
    handle.schedule_job(job, t).await.unwrap();

    for _ in 0..3 {
        step(&mut engine).await;
        clock.advance(secs(10));
    }

    let records = handle
        .execution_history(&ExecutionFilter::for_job(&JobKey::named("j")))
        .await
        .unwrap();
    let scheduled: Vec<_> = records.iter().map(|r| r.scheduled_fire_time).collect();
    assert_eq!(scheduled, [t0() + secs(20), t0() + secs(10)]);
}

#[tokio::test]
async fn store_outage_fails_the_pass_without_losing_triggers() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new());
    let (mut engine, recorder, _gate) = engine_at(store.clone(), &clock);
    let handle = engine.handle();

    let job = Job::new(JobKey::named("j"), "record");
    let t = Trigger::new(TriggerKey::named("t"), job.key.clone(), Schedule::once(t0()));
    handle.schedule_job(job, t).await.unwrap();

    store.set_unavailable(true);
    let err = engine.run_pass().await.unwrap_err();
    assert!(err.is_transient());

    store.set_unavailable(false);
    step(&mut engine).await;
    assert_eq!(recorder.count(), 1);
}
