//! Reconciliation task vocabulary shared by commands and the scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ClientError;

/// How a reconciliation step is driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Step once; its verdict is the task result.
    OneTime,
    /// Step, sleep, repeat. Ends only on `Failure` or cancellation.
    Periodic,
    /// Sleep, step, repeat until the verdict is `Success` or `Failure`.
    PeriodicUntilDone,
}

/// Result of one reconciliation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Running,
    Success,
    Failure,
}

impl Verdict {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Terminal value stored in a task's result slot. Assigned exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The step function returned this verdict.
    Done(Verdict),
    /// The step function raised an error (or panicked).
    Error(String),
    /// The task was cancelled before reaching a verdict.
    Cancelled,
}

impl TaskOutcome {
    /// Map the outcome onto the caller-facing error taxonomy.
    ///
    /// `Done(Success)` and `Done(Running)` (a one-time step that did not
    /// report completion) are both accepted.
    pub fn into_result(self, label: &str) -> Result<Verdict, ClientError> {
        match self {
            Self::Done(Verdict::Failure) => Err(ClientError::TaskFailure {
                reason: format!("{label} reported failure"),
            }),
            Self::Done(verdict) => Ok(verdict),
            Self::Error(reason) => Err(ClientError::TaskFailure {
                reason: format!("{label}: {reason}"),
            }),
            Self::Cancelled => Err(ClientError::Cancelled),
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done(verdict) => write!(f, "{verdict:?}"),
            Self::Error(reason) => write!(f, "error: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}
