//! CiA 402 power state machine.
//!
//! Two pure functions drive the drive-side state machine from the client:
//! [`decode_state`] turns a reported status word into a [`PowerState`], and
//! [`next_control_word`] computes the control word that moves the device one
//! transition closer to OPERATION_ENABLED. Goal tracking lives in the machine
//! controller, which calls these every reconciliation tick.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fmt;

use crate::consts::FAULT_RESET_WORD;

// ─── Status / Control Words ─────────────────────────────────────────

bitflags! {
    /// Status word bits reported by the controller (object 0x6041).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusWord: u16 {
        const READY_TO_SWITCH_ON = 1 << 0;
        const SWITCHED_ON = 1 << 1;
        const OPERATION_ENABLED = 1 << 2;
        const FAULT = 1 << 3;
        const VOLTAGE_ENABLED = 1 << 4;
        const QUICK_STOP = 1 << 5;
        const SWITCH_ON_DISABLED = 1 << 6;
        const WARNING = 1 << 7;
        const REMOTE = 1 << 9;
        const TARGET_REACHED = 1 << 10;
        const INTERNAL_LIMIT = 1 << 11;
    }
}

bitflags! {
    /// Control word bits sent to the controller (object 0x6040).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlWord: u16 {
        const SWITCH_ON = 1 << 0;
        const ENABLE_VOLTAGE = 1 << 1;
        const QUICK_STOP = 1 << 2;
        const ENABLE_OPERATION = 1 << 3;
        const FAULT_RESET = 1 << 7;
        const HALT = 1 << 8;
    }
}

const_assert_eq!(FAULT_RESET_WORD, ControlWord::FAULT_RESET.bits());

// ─── Power State ────────────────────────────────────────────────────

/// Named CiA 402 power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum PowerState {
    /// Status word matched none of the documented patterns.
    #[default]
    Unknown = 0,
    NotReadyToSwitchOn = 1,
    SwitchOnDisabled = 2,
    ReadyToSwitchOn = 3,
    SwitchedOn = 4,
    OperationEnabled = 5,
    QuickStop = 6,
    FaultReactionActive = 7,
    Fault = 8,
}

impl PowerState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::NotReadyToSwitchOn),
            2 => Some(Self::SwitchOnDisabled),
            3 => Some(Self::ReadyToSwitchOn),
            4 => Some(Self::SwitchedOn),
            5 => Some(Self::OperationEnabled),
            6 => Some(Self::QuickStop),
            7 => Some(Self::FaultReactionActive),
            8 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Upper-case protocol name, e.g. `OPERATION_ENABLED`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::NotReadyToSwitchOn => "NOT_READY_TO_SWITCH_ON",
            Self::SwitchOnDisabled => "SWITCH_ON_DISABLED",
            Self::ReadyToSwitchOn => "READY_TO_SWITCH_ON",
            Self::SwitchedOn => "SWITCHED_ON",
            Self::OperationEnabled => "OPERATION_ENABLED",
            Self::QuickStop => "QUICK_STOP",
            Self::FaultReactionActive => "FAULT_REACTION_ACTIVE",
            Self::Fault => "FAULT",
        }
    }

    /// True for the two fault states.
    #[inline]
    pub const fn is_fault(self) -> bool {
        matches!(self, Self::Fault | Self::FaultReactionActive)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Decoding ───────────────────────────────────────────────────────

/// (mask, pattern, state) checked in order; first match wins.
const STATE_PATTERNS: [(u16, u16, PowerState); 8] = [
    (0b0100_1111, 0b0000_0000, PowerState::NotReadyToSwitchOn),
    (0b0100_1111, 0b0100_0000, PowerState::SwitchOnDisabled),
    (0b0110_1111, 0b0010_0001, PowerState::ReadyToSwitchOn),
    (0b0110_1111, 0b0010_0011, PowerState::SwitchedOn),
    (0b0110_1111, 0b0010_0111, PowerState::OperationEnabled),
    (0b0110_1111, 0b0000_0111, PowerState::QuickStop),
    (0b0100_1111, 0b0000_1111, PowerState::FaultReactionActive),
    (0b0100_1111, 0b0000_1000, PowerState::Fault),
];

/// Decode a status word into its power state.
///
/// Total: every input maps to a state, unmatched words decode to
/// [`PowerState::Unknown`].
pub const fn decode_state(status_word: u16) -> PowerState {
    let mut i = 0;
    while i < STATE_PATTERNS.len() {
        let (mask, pattern, state) = STATE_PATTERNS[i];
        if status_word & mask == pattern {
            return state;
        }
        i += 1;
    }
    PowerState::Unknown
}

// ─── Transitions ────────────────────────────────────────────────────

/// Compute the control word that advances `current` toward OPERATION_ENABLED.
///
/// | state               | request          | result                       |
/// |---------------------|------------------|------------------------------|
/// | SWITCH_ON_DISABLED  | shutdown         | `(cw & 0b0111_1110) \| 0b0110` |
/// | READY_TO_SWITCH_ON  | switch on        | `(cw & 0b0111_0111) \| 0b0111` |
/// | SWITCHED_ON         | enable operation | `(cw & 0b0111_1111) \| 0b1111` |
/// | FAULT               | fault reset      | `0b1000_0000`                  |
///
/// With `allow_fault_reset` false a FAULT state releases the reset bit instead,
/// so a persisting fault sees exactly one rising edge per episode. Every other
/// state returns `working` unchanged.
#[inline]
pub const fn next_control_word(current: PowerState, working: u16, allow_fault_reset: bool) -> u16 {
    match current {
        PowerState::SwitchOnDisabled => (working & 0b0111_1110) | 0b0000_0110,
        PowerState::ReadyToSwitchOn => (working & 0b0111_0111) | 0b0000_0111,
        PowerState::SwitchedOn => (working & 0b0111_1111) | 0b0000_1111,
        PowerState::Fault if allow_fault_reset => FAULT_RESET_WORD,
        PowerState::Fault => working & !ControlWord::FAULT_RESET.bits(),
        _ => working,
    }
}
