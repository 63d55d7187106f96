//! Single-assignment result cell.
//!
//! Written once from the scheduler thread, read from anywhere: async readers
//! park on a `tokio::sync::Notify`, blocking readers on a `parking_lot`
//! condition variable.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct Inner<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
    notify: Notify,
}

/// Shared handle to a write-once value.
pub struct Slot<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(None),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Store `value` unless one is already present. Returns whether it was stored.
    pub fn set(&self, value: T) -> bool {
        {
            let mut guard = self.inner.value.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(value);
        }
        self.inner.ready.notify_all();
        self.inner.notify.notify_waiters();
        true
    }

    pub fn get(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    /// Wait for the value without blocking the executor.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }

    /// Block the calling thread until the value arrives or `timeout` elapses.
    /// `None` waits indefinitely.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.value.lock();
        while guard.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.inner.ready.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.ready.wait(&mut guard),
            }
        }
        guard.clone()
    }
}
