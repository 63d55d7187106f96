//! Scheduler thread and cross-thread bridge, driven from a plain test thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use gbc_client::TaskScheduler;
use gbc_client::scheduler::task::Outbox;
use gbc_client::transport::Outbound;
use gbc_common::error::{ClientError, StepError};
use gbc_common::task::{TaskKind, TaskOutcome, Verdict};

fn scheduler() -> TaskScheduler {
    TaskScheduler::start("gbc-scheduler-test").unwrap()
}

#[test]
fn post_and_wait_returns_the_result() {
    let scheduler = scheduler();
    let value = scheduler
        .post_and_wait(async { 6 * 7 }, Duration::from_secs(1))
        .unwrap();
    assert_eq!(value, 42);
    assert!(!scheduler.on_scheduler_thread());
}

#[test]
fn timeout_leaves_nothing_running() {
    let scheduler = scheduler();
    let result = scheduler.post_and_wait(std::future::pending::<()>(), Duration::from_millis(50));
    assert!(matches!(result, Err(ClientError::Timeout { .. })));
    assert!(scheduler.is_idle());
}

#[test]
fn timed_out_task_is_cancelled() {
    let scheduler = scheduler();
    let (outbound, _rx) = Outbound::channel(16);
    let handle = scheduler
        .schedule(
            "never_done",
            TaskKind::PeriodicUntilDone,
            Duration::from_millis(5),
            outbound,
            Box::new(|_| Ok(Verdict::Running)),
        )
        .unwrap();

    let waiter = handle.clone();
    let result = scheduler.post_and_wait(async move { waiter.wait().await }, Duration::from_millis(50));
    assert!(matches!(result, Err(ClientError::Timeout { .. })));
    assert!(!handle.is_finished());

    assert!(handle.cancel_blocking(Duration::from_secs(1)));
    assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
    assert!(scheduler.wait_idle(Duration::from_secs(1)));
}

#[test]
fn until_done_terminates_on_verdict() {
    let scheduler = scheduler();
    let (outbound, _rx) = Outbound::channel(16);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handle = scheduler
        .schedule(
            "countdown",
            TaskKind::PeriodicUntilDone,
            Duration::from_millis(2),
            outbound,
            Box::new(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n == 5 { Verdict::Success } else { Verdict::Running })
            }),
        )
        .unwrap();

    let outcome = handle.wait_blocking(Some(Duration::from_secs(2)));
    assert_eq!(outcome, Some(TaskOutcome::Done(Verdict::Success)));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(scheduler.wait_idle(Duration::from_secs(1)));
}

#[test]
fn periodic_ignores_success() {
    let scheduler = scheduler();
    let (outbound, _rx) = Outbound::channel(16);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handle = scheduler
        .schedule(
            "beat",
            TaskKind::Periodic,
            Duration::from_millis(2),
            outbound,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Verdict::Success)
            }),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());
    assert!(calls.load(Ordering::SeqCst) > 1);
    assert!(!scheduler.is_idle());

    assert!(handle.cancel_blocking(Duration::from_secs(1)));
    assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
}

#[test]
fn failing_step_does_not_take_down_the_scheduler() {
    let scheduler = scheduler();
    let (outbound, rx) = Outbound::channel(1);
    drop(rx);
    let handle = scheduler
        .schedule(
            "orphan",
            TaskKind::Periodic,
            Duration::from_millis(2),
            outbound,
            Box::new(|outbox| {
                outbox.push(serde_json::json!({ "heartbeat": 1 }));
                Ok(Verdict::Running)
            }),
        )
        .unwrap();

    let outcome = handle.wait_blocking(Some(Duration::from_secs(1)));
    assert!(matches!(outcome, Some(TaskOutcome::Error(_))));
    assert!(scheduler.is_running());
    assert_eq!(
        scheduler.post_and_wait(async { "alive" }, Duration::from_secs(1)).unwrap(),
        "alive"
    );
}

#[test]
fn panicking_step_resolves_as_an_error() {
    let scheduler = scheduler();
    let (outbound, _rx) = Outbound::channel(4);
    let handle = scheduler
        .schedule(
            "explodes",
            TaskKind::OneTime,
            Duration::ZERO,
            outbound,
            Box::new(|_: &mut Outbox| -> Result<Verdict, StepError> {
                panic!("step blew up")
            }),
        )
        .unwrap();

    let outcome = handle.wait_blocking(Some(Duration::from_secs(1)));
    assert_eq!(outcome, Some(TaskOutcome::Error("step panicked".to_string())));
    assert!(handle.has_exited());
    assert!(scheduler.is_running());
    assert!(scheduler.wait_idle(Duration::from_secs(1)));
    assert_eq!(
        scheduler.post_and_wait(async { "alive" }, Duration::from_secs(1)).unwrap(),
        "alive"
    );
}

#[test]
fn stop_cancels_outstanding_tasks() {
    let mut scheduler = scheduler();
    let (outbound, _rx) = Outbound::channel(16);
    let handle = scheduler
        .schedule(
            "pending",
            TaskKind::PeriodicUntilDone,
            Duration::from_secs(60),
            outbound.clone(),
            Box::new(|_| Ok(Verdict::Running)),
        )
        .unwrap();

    scheduler.stop();
    assert!(!scheduler.is_running());
    assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
    assert!(matches!(
        scheduler.post(async {}),
        Err(ClientError::SchedulerNotRunning)
    ));
    assert!(matches!(
        scheduler.schedule(
            "late",
            TaskKind::OneTime,
            Duration::ZERO,
            outbound,
            Box::new(|_| Ok(Verdict::Success)),
        ),
        Err(ClientError::SchedulerNotRunning)
    ));
}
