//! Reconciliation tasks and their handles.
//!
//! A [`ReconciliationTask`] wraps a step function and drives it according to
//! its [`TaskKind`]. Each step writes its payloads into an [`Outbox`]; the task
//! flushes them onto the bounded outbound queue after the step returns, so the
//! step itself never awaits and never holds a lock across a suspension point.
//!
//! A [`TaskHandle`] is the caller side: wait for the outcome (async or
//! blocking) and cancel cooperatively. Cancellation takes effect between
//! ticks: a step's payloads are either all flushed or never produced.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use gbc_common::error::StepError;
use gbc_common::task::{TaskKind, TaskOutcome, Verdict};

use super::slot::Slot;
use crate::transport::Outbound;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Payloads produced by one step.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<Value>,
}

impl Outbox {
    pub fn push(&mut self, payload: Value) {
        self.messages.push(payload);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_payloads(self) -> Vec<Value> {
        self.messages
    }
}

/// One reconciliation step.
pub type StepFn = Box<dyn FnMut(&mut Outbox) -> Result<Verdict, StepError> + Send>;

// ─── Shared State ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Queued,
    Running,
    Exited,
}

struct Shared {
    id: u64,
    kind: TaskKind,
    label: &'static str,
    lifecycle: Mutex<Lifecycle>,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    outcome: Slot<TaskOutcome>,
    exited: Slot<()>,
}

impl Shared {
    /// Queued -> Running. False if the task was cancelled before it started.
    fn begin(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Queued => {
                *lifecycle = Lifecycle::Running;
                true
            }
            _ => false,
        }
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.cancel_requested.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Resolves the task when its future is dropped, whatever the reason.
struct ExitGuard {
    shared: Arc<Shared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.shared.outcome.is_set() {
            let outcome = if std::thread::panicking() {
                TaskOutcome::Error("step panicked".to_string())
            } else {
                TaskOutcome::Cancelled
            };
            self.shared.outcome.set(outcome);
        }
        *self.shared.lifecycle.lock() = Lifecycle::Exited;
        self.shared.exited.set(());
    }
}

// ─── Handle ─────────────────────────────────────────────────────────

/// Caller-side view of a scheduled task. Cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("kind", &self.shared.kind)
            .field("outcome", &self.shared.outcome.get())
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    pub fn label(&self) -> &'static str {
        self.shared.label
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.shared.outcome.get()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.outcome.is_set()
    }

    /// True once the task's future is gone (finished, cancelled or never started).
    pub fn has_exited(&self) -> bool {
        self.shared.exited.is_set()
    }

    /// Wait for the outcome from a task running on the scheduler.
    pub async fn wait(&self) -> TaskOutcome {
        self.shared.outcome.wait().await
    }

    /// Block the calling thread for the outcome. Never call this on the
    /// scheduler thread.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Option<TaskOutcome> {
        self.shared.outcome.wait_blocking(timeout)
    }

    /// Signal cancellation without waiting.
    ///
    /// A task that has not started yet resolves `Cancelled` immediately; a
    /// running task stops before its next step, after flushing the current one.
    pub fn request_cancel(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Queued => {
                *lifecycle = Lifecycle::Exited;
                drop(lifecycle);
                self.shared.outcome.set(TaskOutcome::Cancelled);
                self.shared.exited.set(());
            }
            Lifecycle::Running => {
                drop(lifecycle);
                self.shared.cancel_requested.store(true, Ordering::Release);
                self.shared.cancel_notify.notify_waiters();
            }
            Lifecycle::Exited => {}
        }
    }

    /// Cancel and wait until the task has observably exited.
    pub async fn cancel(&self) {
        self.request_cancel();
        self.shared.exited.wait().await;
    }

    /// Cancel and block until the task has exited or `timeout` elapses.
    /// Returns whether the task exited.
    pub fn cancel_blocking(&self, timeout: Duration) -> bool {
        self.request_cancel();
        self.shared.exited.wait_blocking(Some(timeout)).is_some()
    }
}

// ─── Task ───────────────────────────────────────────────────────────

/// A step function plus its driving policy.
pub struct ReconciliationTask {
    shared: Arc<Shared>,
    period: Duration,
    step: StepFn,
    outbound: Outbound,
}

impl ReconciliationTask {
    pub fn new(
        label: &'static str,
        kind: TaskKind,
        period: Duration,
        outbound: Outbound,
        step: StepFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            label,
            lifecycle: Mutex::new(Lifecycle::Queued),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            outcome: Slot::new(),
            exited: Slot::new(),
        });
        Self {
            shared,
            period,
            step,
            outbound,
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    pub fn label(&self) -> &'static str {
        self.shared.label
    }

    /// Future that drives the task to completion.
    ///
    /// The exit guard is armed before the future is first polled, so a task
    /// dropped by its runtime still resolves `Cancelled`.
    pub fn run(self) -> impl Future<Output = ()> + Send + 'static {
        let guard = ExitGuard {
            shared: Arc::clone(&self.shared),
        };
        async move {
            let _guard = guard;
            let mut task = self;
            if !task.shared.begin() {
                trace!(task = task.shared.id, "cancelled before start");
                return;
            }
            let shared = Arc::clone(&task.shared);
            debug!(task = shared.id, label = shared.label, kind = ?shared.kind, "task started");

            let outcome = task.drive().await;

            debug!(task = shared.id, label = shared.label, %outcome, "task finished");
            shared.outcome.set(outcome);
        }
    }

    async fn drive(&mut self) -> TaskOutcome {
        match self.shared.kind {
            TaskKind::OneTime => match self.tick().await {
                Ok(verdict) => TaskOutcome::Done(verdict),
                Err(e) => self.failed(e),
            },
            TaskKind::Periodic => loop {
                match self.tick().await {
                    Ok(Verdict::Failure) => return TaskOutcome::Done(Verdict::Failure),
                    Ok(_) => {}
                    Err(e) => return self.failed(e),
                }
                if !self.pause().await {
                    return TaskOutcome::Cancelled;
                }
            },
            TaskKind::PeriodicUntilDone => loop {
                if !self.pause().await {
                    return TaskOutcome::Cancelled;
                }
                match self.tick().await {
                    Ok(Verdict::Running) => {}
                    Ok(verdict) => return TaskOutcome::Done(verdict),
                    Err(e) => return self.failed(e),
                }
            },
        }
    }

    /// Sleep one period. False if cancelled first.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.period) => true,
            _ = self.shared.cancelled() => false,
        }
    }

    /// Run one step and flush what it produced. Not interrupted by a cancel:
    /// the step has already recorded its payloads as sent.
    async fn tick(&mut self) -> Result<Verdict, StepError> {
        let mut outbox = Outbox::default();
        let verdict = (self.step)(&mut outbox)?;
        for payload in outbox.into_payloads() {
            self.outbound.send(payload.to_string()).await?;
        }
        Ok(verdict)
    }

    fn failed(&self, error: StepError) -> TaskOutcome {
        warn!(task = self.shared.id, label = self.shared.label, %error, "step failed");
        TaskOutcome::Error(error.to_string())
    }
}

static_assertions::assert_impl_all!(TaskHandle: Send, Sync, Clone);
static_assertions::assert_impl_all!(ReconciliationTask: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;

    fn counting_step(limit: u32, terminal: Verdict) -> StepFn {
        let mut calls = 0;
        Box::new(move |outbox| {
            calls += 1;
            outbox.push(serde_json::json!({ "call": calls }));
            Ok(if calls >= limit { terminal } else { Verdict::Running })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn one_time_steps_once() {
        let (outbound, mut rx) = Outbound::channel(4);
        let task = ReconciliationTask::new(
            "once",
            TaskKind::OneTime,
            Duration::from_secs(1),
            outbound,
            counting_step(5, Verdict::Success),
        );
        let handle = task.handle();
        task.run().await;
        // A one-time step's verdict is passed through even when it is Running.
        assert_eq!(handle.outcome(), Some(TaskOutcome::Done(Verdict::Running)));
        assert_eq!(rx.recv().await.unwrap(), r#"{"call":1}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn until_done_stops_at_terminal_verdict() {
        let (outbound, mut rx) = Outbound::channel(8);
        let task = ReconciliationTask::new(
            "until",
            TaskKind::PeriodicUntilDone,
            Duration::from_millis(100),
            outbound,
            counting_step(3, Verdict::Failure),
        );
        let handle = task.handle();
        task.run().await;
        assert_eq!(handle.outcome(), Some(TaskOutcome::Done(Verdict::Failure)));
        let mut sent = 0;
        while rx.try_recv().is_ok() {
            sent += 1;
        }
        assert_eq!(sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_outbound_is_a_task_error() {
        let (outbound, rx) = Outbound::channel(1);
        drop(rx);
        let task = ReconciliationTask::new(
            "orphan",
            TaskKind::OneTime,
            Duration::ZERO,
            outbound,
            counting_step(1, Verdict::Success),
        );
        let handle = task.handle();
        task.run().await;
        assert!(matches!(handle.outcome(), Some(TaskOutcome::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_resolves_immediately() {
        let (outbound, _rx) = Outbound::channel(1);
        let task = ReconciliationTask::new(
            "queued",
            TaskKind::Periodic,
            Duration::from_secs(1),
            outbound,
            counting_step(1, Verdict::Success),
        );
        let handle = task.handle();
        handle.request_cancel();
        assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
        assert!(handle.has_exited());
        // Running it afterwards is a no-op.
        task.run().await;
        assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_until_cancelled() {
        let (outbound, mut rx) = Outbound::channel(64);
        let task = ReconciliationTask::new(
            "beat",
            TaskKind::Periodic,
            Duration::from_secs(1),
            outbound,
            counting_step(1, Verdict::Success),
        );
        let handle = task.handle();
        let join = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!handle.is_finished());
        handle.cancel().await;
        join.await.unwrap();

        assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
        let mut sent = 0;
        while rx.try_recv().is_ok() {
            sent += 1;
        }
        // Steps at t = 0, 1, 2, 3 s.
        assert_eq!(sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_the_current_flush_finish() {
        let (outbound, mut rx) = Outbound::channel(1);
        let task = ReconciliationTask::new(
            "burst",
            TaskKind::PeriodicUntilDone,
            Duration::from_millis(10),
            outbound,
            Box::new(|outbox| {
                outbox.push(serde_json::json!({ "point": 1 }));
                outbox.push(serde_json::json!({ "point": 2 }));
                Ok(Verdict::Running)
            }),
        );
        let handle = task.handle();
        let join = tokio::spawn(task.run());

        // First step at 10 ms; the second payload waits for queue space.
        tokio::time::sleep(Duration::from_millis(15)).await;
        handle.request_cancel();
        tokio::task::yield_now().await;
        assert!(!handle.has_exited());

        assert_eq!(rx.recv().await.unwrap(), r#"{"point":1}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"point":2}"#);
        join.await.unwrap();
        assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_future_resolves_cancelled() {
        let (outbound, _rx) = Outbound::channel(1);
        let task = ReconciliationTask::new(
            "dropped",
            TaskKind::PeriodicUntilDone,
            Duration::from_secs(60),
            outbound,
            counting_step(1, Verdict::Success),
        );
        let handle = task.handle();
        drop(task.run());
        assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
        assert!(handle.has_exited());
    }
}
