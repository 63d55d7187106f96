//! Error taxonomy for the client.
//!
//! [`ClientError`] is what callers of the controllers and the `Robot` facade
//! see. [`StepError`] is raised inside a single reconciliation step and ends
//! only that task. [`DecodeError`] covers malformed inbound frames, which the
//! observers log and swallow.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Caller-facing errors.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Invalid command parameters, rejected when the command is built.
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// No transport connection is available.
    #[error("Not connected to the controller")]
    Disconnected,

    /// A reconciliation step reported failure or raised an error.
    #[error("Task failed: {reason}")]
    TaskFailure { reason: String },

    /// The caller's deadline elapsed; the underlying task was cancelled.
    #[error("Timed out after {after:?}")]
    Timeout { after: Duration },

    /// The task was cancelled before it produced a verdict.
    #[error("Task cancelled")]
    Cancelled,

    /// The scheduler thread is not running (never started or already stopped).
    #[error("Scheduler is not running")]
    SchedulerNotRunning,

    /// A blocking call was issued from the scheduler thread itself.
    #[error("Blocking call issued from the scheduler thread")]
    SchedulerThread,

    /// Transport setup or I/O failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error raised by a reconciliation step. Terminates that task only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The outbound queue has no consumer any more.
    #[error("outbound channel closed")]
    OutboundClosed,

    /// The command could not be turned into a wire payload.
    #[error("cannot build payload: {0}")]
    Payload(String),
}

/// Inbound frame decoding failure.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not valid JSON, or a section did not have the expected shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A field carried a value outside its enumeration.
    #[error("invalid value {value} for {field}")]
    InvalidField { field: &'static str, value: i64 },
}
