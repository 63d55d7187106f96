//! Task scheduler.
//!
//! One dedicated OS thread runs a current-thread tokio runtime. Controller
//! loops, reconciliation tasks and transport I/O are all spawned onto it, so
//! no two reconciliation steps ever execute concurrently. Other threads talk to
//! it only through [`TaskScheduler::post`] and [`TaskScheduler::post_and_wait`].

pub mod slot;
pub mod task;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, sync_channel};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle as ThreadHandle, ThreadId};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gbc_common::consts::CANCEL_GRACE;
use gbc_common::error::ClientError;
use gbc_common::task::TaskKind;

use self::slot::Slot;
use self::task::{ReconciliationTask, StepFn, TaskHandle};
use crate::transport::Outbound;

pub use self::task::Outbox;

// ─── Spawner ────────────────────────────────────────────────────────

/// Spawns work onto the scheduler's runtime and counts live tasks.
///
/// Reconciliation tasks and posted work are counted; long-lived service
/// loops (controllers, transport) are not, so an idle scheduler is one with
/// no outstanding caller work.
#[derive(Clone)]
pub struct Spawner {
    runtime: Handle,
    active: Arc<AtomicUsize>,
}

impl Spawner {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawner for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Start a reconciliation task and return its handle.
    pub fn spawn(&self, task: ReconciliationTask) -> TaskHandle {
        let handle = task.handle();
        let tracked = Tracked::new(task.run(), Arc::clone(&self.active), None);
        self.runtime.spawn(tracked);
        handle
    }

    /// Start a long-lived service loop. Not counted towards [`active_tasks`](Self::active_tasks).
    pub fn spawn_service<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn spawn_tracked<F>(&self, future: F, exited: Slot<()>) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime
            .spawn(Tracked::new(future, Arc::clone(&self.active), Some(exited)))
    }
}

/// Future wrapper that keeps the active count and signals its own drop.
///
/// Field order matters: the inner future is dropped before the exit signal
/// fires, so anything it owns is released by the time waiters wake.
struct Tracked<F> {
    future: Pin<Box<F>>,
    _exit: ExitSignal,
}

struct ExitSignal {
    active: Arc<AtomicUsize>,
    exited: Option<Slot<()>>,
}

impl<F> Tracked<F> {
    fn new(future: F, active: Arc<AtomicUsize>, exited: Option<Slot<()>>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            future: Box::pin(future),
            _exit: ExitSignal { active, exited },
        }
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(exited) = &self.exited {
            exited.set(());
        }
    }
}

// ─── Posted Work ────────────────────────────────────────────────────

/// Work submitted from another thread. The result arrives over a
/// per-call channel.
pub struct Posted<T> {
    result: Receiver<T>,
    join: JoinHandle<()>,
    exited: Slot<()>,
}

impl<T> Posted<T> {
    /// Block until the result is ready. On timeout the work is aborted and
    /// this returns only after it has exited.
    pub fn wait(self, timeout: Duration) -> Result<T, ClientError> {
        match self.result.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                debug!(?timeout, "posted work timed out, aborting");
                self.abort();
                Err(ClientError::Timeout { after: timeout })
            }
            // Sender dropped without a value: aborted by shutdown, or panicked.
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Cancelled),
        }
    }

    /// Abort the work and wait for it to exit.
    pub fn abort(&self) {
        self.join.abort();
        if self.exited.wait_blocking(Some(CANCEL_GRACE)).is_none() {
            warn!("posted work did not exit within {:?}", CANCEL_GRACE);
        }
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────

/// Owner of the scheduler thread.
pub struct TaskScheduler {
    spawner: Spawner,
    thread_id: ThreadId,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<ThreadHandle<()>>,
}

impl TaskScheduler {
    /// Spawn the scheduler thread and wait for its runtime to come up.
    pub fn start(name: &str) -> Result<Self, ClientError> {
        let (ready_tx, ready_rx) = sync_channel::<Result<Handle, String>>(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime drops every outstanding task; their
                // exit guards resolve them as cancelled.
                drop(runtime);
                debug!("scheduler thread exiting");
            })
            .map_err(|e| ClientError::Transport(format!("cannot spawn scheduler thread: {e}")))?;

        let runtime = match ready_rx.recv() {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(ClientError::Transport(format!("cannot build runtime: {e}")));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(ClientError::SchedulerNotRunning);
            }
        };

        info!(thread = name, "scheduler started");
        Ok(Self {
            spawner: Spawner::new(runtime),
            thread_id: thread.thread().id(),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some() && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// True when called from the scheduler thread.
    pub fn on_scheduler_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Create and start a reconciliation task.
    pub fn schedule(
        &self,
        label: &'static str,
        kind: TaskKind,
        period: Duration,
        outbound: Outbound,
        step: StepFn,
    ) -> Result<TaskHandle, ClientError> {
        self.ensure_running()?;
        let task = ReconciliationTask::new(label, kind, period, outbound, step);
        Ok(self.spawner.spawn(task))
    }

    /// Submit `future` to the scheduler thread without waiting for it.
    pub fn post<F>(&self, future: F) -> Result<Posted<F::Output>, ClientError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        let (tx, rx) = sync_channel(1);
        let exited = Slot::new();
        let join = self.spawner.spawn_tracked(
            async move {
                let value = future.await;
                let _ = tx.send(value);
            },
            exited.clone(),
        );
        Ok(Posted {
            result: rx,
            join,
            exited,
        })
    }

    /// Submit `future` and block the calling thread for its result.
    ///
    /// On timeout the work is cancelled and has exited by the time
    /// `ClientError::Timeout` is returned. Refused on the scheduler thread,
    /// which must never block.
    pub fn post_and_wait<F>(&self, future: F, timeout: Duration) -> Result<F::Output, ClientError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.on_scheduler_thread() {
            return Err(ClientError::SchedulerThread);
        }
        self.post(future)?.wait(timeout)
    }

    /// No reconciliation task or posted work is outstanding.
    pub fn is_idle(&self) -> bool {
        self.spawner.active_tasks() == 0
    }

    /// Poll [`is_idle`](Self::is_idle) until it holds or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop the runtime and join the thread. Outstanding tasks resolve as
    /// cancelled.
    pub fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if self.on_scheduler_thread() {
                warn!("scheduler stopped from its own thread, not joining");
                return;
            }
            if thread.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        info!("scheduler stopped");
    }

    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ClientError::SchedulerNotRunning)
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

static_assertions::assert_impl_all!(TaskScheduler: Send);
static_assertions::assert_impl_all!(Spawner: Send, Sync, Clone);
