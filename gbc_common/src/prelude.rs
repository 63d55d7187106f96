//! Common re-exports: `use gbc_common::prelude::*;`

// ─── CiA 402 ────────────────────────────────────────────────────────
pub use crate::cia402::{ControlWord, PowerState, StatusWord, decode_state, next_control_word};

// ─── Commands & Payloads ────────────────────────────────────────────
pub use crate::command::{
    Command, Pose, Position, PositionReference, Quaternion, Route, StreamCommandType,
};
pub use crate::message::MessageBuilder;

// ─── Observations ───────────────────────────────────────────────────
pub use crate::observation::{
    JointStates, MachineTarget, OperationError, StatusObservation, StreamObservation,
    StreamState, TelemetrySnapshot,
};

// ─── Tasks & Errors ─────────────────────────────────────────────────
pub use crate::error::{ClientError, DecodeError, StepError};
pub use crate::task::{TaskKind, TaskOutcome, Verdict};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ClientConfig, ConfigError, ConfigLoader, LogLevel, SharedConfig};
