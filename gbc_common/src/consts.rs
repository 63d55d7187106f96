//! Protocol constants shared by the client crates.

use std::time::Duration;

/// Control word the machine controller starts from before the first transition.
pub const INITIAL_CONTROL_WORD: u16 = 0b1000_0000;

/// Control word requesting a fault reset (bit 7 raised, everything else low).
pub const FAULT_RESET_WORD: u16 = 0b1000_0000;

/// Minimum free stream slots required before another item is dispatched.
pub const DEFAULT_MIN_CAPACITY: i32 = 15;

/// Stream activity type codes understood by the controller.
pub const ACTIVITY_MOVE_JOINTS: u8 = 3;
pub const ACTIVITY_MOVE_LINE: u8 = 5;
pub const ACTIVITY_MOVE_TO_POSITION: u8 = 10;
pub const ACTIVITY_MOVE_JOINTS_INTERPOLATED: u8 = 16;

/// Largest payload accepted by the serial channel.
pub const MAX_SERIAL_BYTES: usize = 255;

/// Highest heartbeat frequency the client will schedule.
pub const MAX_HEARTBEAT_HZ: u32 = 100;

/// Default controller endpoint.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:9001/ws";

/// Longest default timeout accepted for blocking calls (one day).
pub const MAX_TIMEOUT_S: f64 = 86_400.0;

/// How long a cancelled task is given to observably exit.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);
