//! Controllers: long-lived loops that turn queued commands into running
//! reconciliation tasks.
//!
//! Both controllers share the same shape. Callers on any thread enqueue a
//! command and get a [`TaskHandle`] back immediately; the controller loop, on
//! the scheduler thread, starts queued tasks one tick at a time once the link
//! is up and the relevant observation has arrived.

pub mod machine;
pub mod stream;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::scheduler::task::{ReconciliationTask, TaskHandle};

pub use self::machine::MachineController;
pub use self::stream::{StreamController, StreamJob};

/// A task waiting to be started, plus how the loop must gate it.
pub(crate) struct Pending<G> {
    pub task: ReconciliationTask,
    pub handle: TaskHandle,
    pub gate: G,
}

impl<G> Pending<G> {
    pub fn new(task: ReconciliationTask, gate: G) -> Self {
        let handle = task.handle();
        Self { task, handle, gate }
    }
}

/// FIFO with priority-prepend, shared between callers and the loop.
pub(crate) struct CommandQueue<G> {
    inner: Arc<Mutex<VecDeque<Pending<G>>>>,
}

impl<G> Clone for CommandQueue<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G> CommandQueue<G> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push_back(&self, pending: Pending<G>) -> TaskHandle {
        let handle = pending.handle.clone();
        self.inner.lock().push_back(pending);
        handle
    }

    pub fn push_front(&self, pending: Pending<G>) -> TaskHandle {
        let handle = pending.handle.clone();
        self.inner.lock().push_front(pending);
        handle
    }

    /// Pop the head if `admit` accepts its gate. A head cancelled while
    /// queued is discarded and the next one considered.
    pub fn pop_admitted(&self, mut admit: impl FnMut(&G) -> bool) -> Option<Pending<G>> {
        let mut queue = self.inner.lock();
        loop {
            let head = queue.front()?;
            if head.handle.has_exited() {
                if let Some(stale) = queue.pop_front() {
                    debug!(task = stale.handle.id(), label = stale.handle.label(), "dropping cancelled task");
                }
                continue;
            }
            if !admit(&head.gate) {
                return None;
            }
            return queue.pop_front();
        }
    }

    /// Remove every queued task, resolving each as cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending<G>> = self.inner.lock().drain(..).collect();
        for pending in &drained {
            pending.handle.request_cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn downgrade(&self) -> std::sync::Weak<Mutex<VecDeque<Pending<G>>>> {
        Arc::downgrade(&self.inner)
    }

    pub fn from_weak(weak: &std::sync::Weak<Mutex<VecDeque<Pending<G>>>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

/// Join handle of a controller's service loop.
#[derive(Default)]
pub(crate) struct ServiceSlot {
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceSlot {
    /// Store `start()`'s handle unless a loop is already running.
    pub fn start(&self, start: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut join = self.join.lock();
        if join.as_ref().is_some_and(|j| !j.is_finished()) {
            return false;
        }
        *join = Some(start());
        true
    }

    pub fn stop(&self) -> bool {
        match self.join.lock().take() {
            Some(join) => {
                join.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.lock().as_ref().is_some_and(|j| !j.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;
    use gbc_common::task::{TaskKind, TaskOutcome, Verdict};
    use std::time::Duration;

    fn pending(label: &'static str, gate: bool) -> Pending<bool> {
        let (outbound, _rx) = Outbound::channel(1);
        let task = ReconciliationTask::new(
            label,
            TaskKind::OneTime,
            Duration::ZERO,
            outbound,
            Box::new(|_| Ok(Verdict::Success)),
        );
        Pending::new(task, gate)
    }

    #[test]
    fn prepend_jumps_the_queue() {
        let queue = CommandQueue::new();
        queue.push_back(pending("a", true));
        queue.push_front(pending("urgent", true));
        let head = queue.pop_admitted(|_| true).unwrap();
        assert_eq!(head.handle.label(), "urgent");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn gate_holds_head_in_place() {
        let queue = CommandQueue::new();
        queue.push_back(pending("held", false));
        queue.push_back(pending("behind", true));
        assert!(queue.pop_admitted(|open| *open).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn cancelled_heads_are_skipped() {
        let queue = CommandQueue::new();
        let first = queue.push_back(pending("first", true));
        queue.push_back(pending("second", true));
        first.request_cancel();
        let head = queue.pop_admitted(|_| true).unwrap();
        assert_eq!(head.handle.label(), "second");
    }

    #[test]
    fn cancel_all_resolves_every_task() {
        let queue = CommandQueue::new();
        let a = queue.push_back(pending("a", true));
        let b = queue.push_back(pending("b", true));
        assert_eq!(queue.cancel_all(), 2);
        assert_eq!(a.outcome(), Some(TaskOutcome::Cancelled));
        assert_eq!(b.outcome(), Some(TaskOutcome::Cancelled));
        assert_eq!(queue.len(), 0);
    }
}
