//! GBC Common Library
//!
//! Shared types for the GBC motion controller client: the CiA 402 power
//! state engine, decoded controller observations, the command sum type,
//! wire message builders, error taxonomy and configuration loading.
//!
//! # Module Structure
//!
//! - [`cia402`] - Status word decoding and control word stepping
//! - [`observation`] - Status, stream and telemetry snapshots decoded from inbound frames
//! - [`command`] - Commands accepted by the machine and stream controllers
//! - [`message`] - JSON payload builders for every command variant
//! - [`task`] - Reconciliation kinds, verdicts and outcomes
//! - [`error`] - Client, step and decode errors
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use gbc_common::prelude::*;
//!
//! assert_eq!(decode_state(0x0027), PowerState::OperationEnabled);
//! ```

pub mod cia402;
pub mod command;
pub mod config;
pub mod consts;
pub mod error;
pub mod message;
pub mod observation;
pub mod prelude;
pub mod task;
