//! # GBC Client Library
//!
//! Control-plane client for GBC motion controllers. All network I/O and every
//! reconciliation step run on one scheduler thread; callers use the blocking
//! [`Robot`] facade or queue commands on the controllers directly.
//!
//! # Module Structure
//!
//! - [`scheduler`] - Scheduler thread, reconciliation tasks, cross-thread bridge
//! - [`observer`] - Observation sinks and inbound frame observers
//! - [`transport`] - Outbound queue, connection state, websocket transport
//! - [`controller`] - Machine (CiA 402, heartbeat, I/O) and stream (motion) controllers
//! - [`robot`] - Synchronous facade
//!
//! # Architecture
//!
//! ```text
//! caller thread                      scheduler thread ("gbc-scheduler")
//! ┌───────────┐  post_and_wait   ┌──────────────────────────────────────┐
//! │   Robot   │ ───────────────► │ MachineController   StreamController │
//! └───────────┘                  │        │ tasks            │ tasks     │
//!                                │        ▼                  ▼           │
//!                                │     Outbound (bounded mpsc)          │
//!                                │        │                             │
//!                                │        ▼                             │
//!                                │   WsTransport ──► Observers ──► Sinks│
//!                                └──────────────────────────────────────┘
//! ```

pub mod controller;
pub mod observer;
pub mod robot;
pub mod scheduler;
pub mod transport;

pub use crate::controller::{MachineController, StreamController, StreamJob};
pub use crate::robot::{Robot, TrajectoryPoint};
pub use crate::scheduler::TaskScheduler;
pub use crate::scheduler::task::TaskHandle;
