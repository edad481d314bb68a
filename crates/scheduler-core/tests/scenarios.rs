//! End-to-end scheduler behavior: trigger fire through admission, subprocess
//! execution, reaping, and the retry/success-repeat/mode side effects that
//! follow. Each test drives a real `Engine` with a `FakeClock` and real
//! (but near-instant) subprocesses, ticking manually instead of running
//! `spawn_loop` so event ordering stays deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use scheduler_core::catalog::{
    JobStep, KeywordKind, KeywordRule, NotificationFlags, ResourceGroupSpec, RetryPolicy,
};
use scheduler_core::notify::{NotificationPayload, Notifier, NullWebhookSink, WebhookSink};
use scheduler_core::trigger::{TimeWindow, Trigger};
use scheduler_core::{Catalog, Engine, FakeClock, Job, Mode, RunStatus};

fn group(name: &str, max: u32) -> ResourceGroupSpec {
    ResourceGroupSpec { name: name.to_string(), max_concurrent: max }
}

fn command(argv: &[&str]) -> Vec<JobStep> {
    vec![JobStep::CommandExec {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        continue_on_error: false,
    }]
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn cron_trigger_fires_runs_and_completes_then_advances_to_the_next_slot() {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 4, 59).unwrap();
    let clock = FakeClock::new(start);
    let job = Job::builder()
        .id("cron-job".to_string())
        .name("cron-job".to_string())
        .priority(0)
        .resource_group("G".to_string())
        .trigger(Trigger::Cron { expression: "*/5 * * * *".to_string(), timezone: None })
        .steps(command(&["echo", "hi"]))
        .build();
    let catalog = Catalog::new(vec![job], vec![group("G", 1)]).unwrap();
    let engine = Engine::new(Arc::new(clock.clone()), catalog, Notifier::new(Box::new(NullWebhookSink)));
    engine.start().await;

    engine.tick().await;
    assert!(engine.live_run_for_job("cron-job").is_none(), "not due until 12:05:00");

    clock.advance(Duration::from_secs(1));
    engine.tick().await;
    let running = engine.live_run_for_job("cron-job").expect("run enqueued at the fire time");
    assert_eq!(running.status, RunStatus::Running);

    settle().await;
    engine.tick().await;
    let history = engine.terminal_history("cron-job");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Completed);
    assert_eq!(history[0].exit_code, Some(0));

    // Not yet due again.
    clock.set(Utc.with_ymd_and_hms(2026, 1, 1, 12, 9, 59).unwrap());
    engine.tick().await;
    assert!(engine.live_run_for_job("cron-job").is_none());

    // The next five-minute slot.
    clock.set(Utc.with_ymd_and_hms(2026, 1, 1, 12, 10, 0).unwrap());
    engine.tick().await;
    let second_run = engine.live_run_for_job("cron-job").expect("next slot due");
    assert_eq!(second_run.scheduled_for, Utc.with_ymd_and_hms(2026, 1, 1, 12, 10, 0).unwrap());
}

#[tokio::test]
async fn lower_priority_job_waits_behind_a_full_group_then_starts_on_release() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = FakeClock::new(t0);
    let holder = Job::builder()
        .id("holder".to_string())
        .name("holder".to_string())
        .priority(0)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["sh", "-c", "sleep 0.3"]))
        .build();
    let waiter = Job::builder()
        .id("waiter".to_string())
        .name("waiter".to_string())
        .priority(5)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["echo", "hi"]))
        .build();
    let catalog = Catalog::new(vec![holder, waiter], vec![group("G", 1)]).unwrap();
    let engine = Engine::new(Arc::new(clock.clone()), catalog, Notifier::new(Box::new(NullWebhookSink)));
    engine.start().await;

    // One tick before the fire instant caches next_fire for both jobs.
    clock.set(t0 - chrono::Duration::milliseconds(1));
    engine.tick().await;

    clock.set(t0);
    engine.tick().await;

    let running = engine.live_run_for_job("holder").unwrap();
    assert_eq!(running.status, RunStatus::Running);
    let waiting = engine.live_run_for_job("waiter").unwrap();
    assert_eq!(waiting.status, RunStatus::Pending, "group is at capacity");

    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.tick().await; // reaps the holder, releasing the group
    engine.tick().await; // admits the waiter now that a slot is free

    let waiter_run = engine.live_run_for_job("waiter").expect("admitted once the slot freed");
    assert_eq!(waiter_run.status, RunStatus::Running);
}

#[tokio::test]
async fn failing_command_retries_after_its_delay_then_stops_at_the_configured_max() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = FakeClock::new(t0);
    let job = Job::builder()
        .id("flaky".to_string())
        .name("flaky".to_string())
        .priority(0)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["false"]))
        .retry(RetryPolicy { max_failure_retries: 2, failure_retry_delay_seconds: 1, ..RetryPolicy::default() })
        .build();
    let catalog = Catalog::new(vec![job], vec![group("G", 1)]).unwrap();
    let engine = Engine::new(Arc::new(clock.clone()), catalog, Notifier::new(Box::new(NullWebhookSink)));
    engine.start().await;

    clock.set(t0 - chrono::Duration::milliseconds(1));
    engine.tick().await;
    clock.set(t0);
    engine.tick().await; // admits attempt 1

    settle().await;
    engine.tick().await; // reaps attempt 1 as failed, schedules attempt 2 a second later

    let retry = engine.live_run_for_job("flaky").expect("retry queued");
    assert_eq!(retry.status, RunStatus::Pending);
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.scheduled_for, t0 + chrono::Duration::seconds(1));

    // The delay hasn't elapsed: admission must not jump the gun.
    engine.tick().await;
    assert_eq!(engine.live_run_for_job("flaky").unwrap().status, RunStatus::Pending);

    clock.advance(Duration::from_secs(1));
    engine.tick().await; // admits attempt 2
    assert_eq!(engine.live_run_for_job("flaky").unwrap().status, RunStatus::Running);

    settle().await;
    engine.tick().await; // reaps attempt 2; max_failure_retries exhausted

    assert!(engine.live_run_for_job("flaky").is_none(), "no third attempt past the configured max");
    let history = engine.terminal_history("flaky");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == RunStatus::Failed));
}

#[tokio::test]
async fn success_repeat_waits_its_delay_then_stops_once_the_counter_is_exhausted() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
    let window = TimeWindow {
        start: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end: chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
    };
    let clock = FakeClock::new(t0);
    let job = Job::builder()
        .id("repeater".to_string())
        .name("repeater".to_string())
        .priority(0)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["true"]))
        .retry(RetryPolicy {
            success_repeat_within_window: true,
            success_repeat_delay_seconds: 60,
            success_repeat_max: 1,
            ..RetryPolicy::default()
        })
        .success_repeat_window(Some(window))
        .build();
    let catalog = Catalog::new(vec![job], vec![group("G", 1)]).unwrap();
    let engine = Engine::new(Arc::new(clock.clone()), catalog, Notifier::new(Box::new(NullWebhookSink)));
    engine.start().await;

    clock.set(t0 - chrono::Duration::milliseconds(1));
    engine.tick().await;
    clock.set(t0);
    engine.tick().await; // admits the first run

    settle().await;
    engine.tick().await; // reaps it, schedules one repeat 60s out

    let repeat = engine.live_run_for_job("repeater").expect("repeat queued within the window");
    assert_eq!(repeat.status, RunStatus::Pending);
    assert_eq!(repeat.scheduled_for, t0 + chrono::Duration::seconds(60));
    assert_eq!(repeat.success_repeat_count, 1);

    engine.tick().await;
    assert_eq!(engine.live_run_for_job("repeater").unwrap().status, RunStatus::Pending, "delay not yet elapsed");

    clock.advance(Duration::from_secs(60));
    engine.tick().await; // admits the repeat
    settle().await;
    engine.tick().await; // reaps it; success_repeat_max is exhausted

    assert!(engine.live_run_for_job("repeater").is_none(), "no further repeat past success_repeat_max");
    assert_eq!(engine.terminal_history("repeater").len(), 2);
}

struct CountingSink(Arc<AtomicUsize>);

#[async_trait]
impl WebhookSink for CountingSink {
    async fn deliver(&self, _payload: NotificationPayload) -> Result<(), String> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn a_failure_keyword_fails_the_run_and_dispatches_a_notification() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = FakeClock::new(t0);
    let deliveries = Arc::new(AtomicUsize::new(0));
    let mut notifications = NotificationFlags::default();
    notifications.notify_on_failure = true;
    notifications.notify_on_keyword = true;
    let job = Job::builder()
        .id("noisy".to_string())
        .name("noisy".to_string())
        .priority(0)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["sh", "-c", "echo OK; echo 'FATAL: disk full'; exit 0"]))
        .keyword_rules(vec![KeywordRule {
            patterns: vec!["FATAL".to_string()],
            kind: KeywordKind::Failure,
            message: "disk full alert".to_string(),
            case_sensitive: true,
            abort_on_hit: false,
        }])
        .notifications(notifications)
        .build();
    let catalog = Catalog::new(vec![job], vec![group("G", 1)]).unwrap();
    let notifier = Notifier::new(Box::new(CountingSink(deliveries.clone())));
    let engine = Engine::new(Arc::new(clock.clone()), catalog, notifier);
    engine.start().await;

    clock.set(t0 - chrono::Duration::milliseconds(1));
    engine.tick().await;
    clock.set(t0);
    engine.tick().await;

    settle().await;
    engine.tick().await;

    let history = engine.terminal_history("noisy");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failed);
    assert_eq!(history[0].keyword_hits, vec!["FATAL: disk full".to_string()]);
    assert_eq!(deliveries.load(Ordering::SeqCst), 2, "run_failed and keyword_hit each dispatch once");
}

#[tokio::test]
async fn switching_to_single_mode_preempts_pending_runs_but_leaves_running_ones_alone() {
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = FakeClock::new(t0);
    let long_runner = Job::builder()
        .id("long-runner".to_string())
        .name("long-runner".to_string())
        .priority(0)
        .resource_group("G".to_string())
        .trigger(Trigger::Interval { spec: "1h".to_string() })
        .steps(command(&["sh", "-c", "sleep 5"]))
        .build();
    let second = Job::builder()
        .id("second".to_string())
        .name("second".to_string())
        .priority(1)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["echo", "hi"]))
        .build();
    let third = Job::builder()
        .id("third".to_string())
        .name("third".to_string())
        .priority(2)
        .resource_group("G".to_string())
        .trigger(Trigger::SpecificDate { at: t0 })
        .steps(command(&["echo", "hi"]))
        .build();
    let catalog = Catalog::new(vec![long_runner, second, third], vec![group("G", 1)]).unwrap();
    let engine = Engine::new(Arc::new(clock.clone()), catalog, Notifier::new(Box::new(NullWebhookSink)));

    // Seed the group's single slot with a manual run before the loop starts;
    // manual_run is only refused once AUTO ticking is under way.
    assert_eq!(engine.mode(), Mode::Auto);
    let manual_run_id = engine.manual_run("long-runner").unwrap();

    engine.start().await;
    engine.tick().await; // admits the manual run and enqueues second/third, both blocked on the full group
    assert_eq!(engine.run(manual_run_id).unwrap().status, RunStatus::Running);

    assert_eq!(engine.live_run_for_job("second").unwrap().status, RunStatus::Pending);
    assert_eq!(engine.live_run_for_job("third").unwrap().status, RunStatus::Pending);
    assert_eq!(engine.status().running_runs, 1);
    assert_eq!(engine.status().queue_depth, 2);

    engine.set_mode(Mode::Single).await;

    assert_eq!(engine.live_run_for_job("second").unwrap().status, RunStatus::Preempted);
    assert_eq!(engine.live_run_for_job("third").unwrap().status, RunStatus::Preempted);
    assert_eq!(engine.status().queue_depth, 0);
    assert_eq!(engine.run(manual_run_id).unwrap().status, RunStatus::Running, "the running run is untouched");

    // Once the long runner ends, nothing fills the freed slot on its own:
    // SINGLE mode admits only a fresh manual run or a mode switch back to AUTO.
    engine.cancel_run(manual_run_id).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.tick().await;
    assert_eq!(engine.status().running_runs, 0);
    assert_eq!(engine.status().queue_depth, 0);
}
