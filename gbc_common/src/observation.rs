//! Structured snapshots of controller state, decoded from inbound frames.
//!
//! Every inbound frame is a JSON object. A frame may carry any subset of the
//! `status`, `stream` and `telemetry` sections; each decoder returns
//! `Ok(None)` when its section is absent and `Err` when it is present but
//! malformed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cia402::{PowerState, decode_state};
use crate::error::DecodeError;

// ─── Enumerations ───────────────────────────────────────────────────

/// Run state of the controller's activity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum StreamState {
    #[default]
    Idle = 0,
    Active = 1,
    Paused = 2,
    PausedByActivity = 3,
    Stopping = 4,
    Stopped = 5,
}

impl StreamState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Active),
            2 => Some(Self::Paused),
            3 => Some(Self::PausedByActivity),
            4 => Some(Self::Stopping),
            5 => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Where the controller sends its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MachineTarget {
    #[default]
    None = 0,
    Fieldbus = 1,
    Simulation = 2,
}

impl MachineTarget {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Fieldbus),
            2 => Some(Self::Simulation),
            _ => None,
        }
    }
}

/// Operation error reported by the controller alongside the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u16)]
pub enum OperationError {
    #[default]
    None = 0,
    HeartbeatLost = 1,
    LimitReached = 2,
    InvalidArc = 3,
    ToolInvalid = 4,
    FeedrateTooHigh = 5,
    InvalidKinematics = 6,
    OutsideWorkspace = 7,
    SingularityApproach = 8,
    MaxJointVelocity = 9,
    MaxJointAcceleration = 10,
    ConfigurationChange = 11,
    PoseOutOfReach = 12,
    ActivityTimeout = 13,
    JointLimitExceeded = 14,
    /// Code outside the documented table.
    Unrecognized = u16::MAX,
}

impl OperationError {
    /// Convert from the raw code; undocumented codes map to `Unrecognized`.
    pub const fn from_code(code: u16) -> Self {
        match code {
            0 => Self::None,
            1 => Self::HeartbeatLost,
            2 => Self::LimitReached,
            3 => Self::InvalidArc,
            4 => Self::ToolInvalid,
            5 => Self::FeedrateTooHigh,
            6 => Self::InvalidKinematics,
            7 => Self::OutsideWorkspace,
            8 => Self::SingularityApproach,
            9 => Self::MaxJointVelocity,
            10 => Self::MaxJointAcceleration,
            11 => Self::ConfigurationChange,
            12 => Self::PoseOutOfReach,
            13 => Self::ActivityTimeout,
            14 => Self::JointLimitExceeded,
            _ => Self::Unrecognized,
        }
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::None)
    }
}

// ─── Status ─────────────────────────────────────────────────────────

/// Machine-level status snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusObservation {
    pub machine_status_word: u16,
    /// Heartbeat counter the controller expects to be echoed back.
    pub heartbeat_echo: u64,
    pub operation_error: OperationError,
    pub operation_error_message: String,
    pub kinematics_limits_disabled: bool,
    pub feed_rate_target: f64,
    pub feed_rate_actual: f64,
    pub target: MachineTarget,
    /// Effective value of each digital output, by index.
    pub digital_outputs: Vec<bool>,
    /// Effective value of each integer output, by index.
    pub integer_outputs: Vec<i64>,
}

impl StatusObservation {
    /// Decoded CiA 402 power state.
    #[inline]
    pub fn power_state(&self) -> PowerState {
        decode_state(self.machine_status_word)
    }

    pub fn from_frame(frame: &Value) -> Result<Option<Self>, DecodeError> {
        let Some(section) = frame.get("status") else {
            return Ok(None);
        };
        let raw = RawStatus::deserialize(section)?;
        let machine = raw.machine;
        let target = MachineTarget::from_u8(machine.target).ok_or(DecodeError::InvalidField {
            field: "status.machine.target",
            value: i64::from(machine.target),
        })?;
        let kc = raw.kc.into_iter().next().unwrap_or_default();

        Ok(Some(Self {
            machine_status_word: machine.status_word,
            heartbeat_echo: machine.heartbeat.unwrap_or_default(),
            operation_error: OperationError::from_code(machine.operation_error),
            operation_error_message: machine.operation_error_message.unwrap_or_default(),
            kinematics_limits_disabled: kc.limits_disabled,
            feed_rate_target: kc.fro_target,
            feed_rate_actual: kc.fro_actual,
            target,
            digital_outputs: raw.dout.into_iter().map(|d| d.effective_value).collect(),
            integer_outputs: raw.iout.into_iter().map(|i| i.effective_value).collect(),
        }))
    }
}

#[derive(Deserialize)]
struct RawStatus {
    machine: RawMachine,
    #[serde(default)]
    kc: Vec<RawKinematics>,
    #[serde(default)]
    dout: Vec<RawOutput<bool>>,
    #[serde(default)]
    iout: Vec<RawOutput<i64>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMachine {
    status_word: u16,
    #[serde(default)]
    heartbeat: Option<u64>,
    #[serde(default)]
    operation_error: u16,
    #[serde(default)]
    operation_error_message: Option<String>,
    #[serde(default)]
    target: u8,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawKinematics {
    limits_disabled: bool,
    fro_target: f64,
    fro_actual: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutput<T> {
    effective_value: T,
}

// ─── Stream ─────────────────────────────────────────────────────────

/// Activity stream snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamObservation {
    /// Free slots in the controller's stream buffer.
    pub capacity: i32,
    pub queued: i32,
    /// Last tag the controller has fully retired.
    pub tag: u64,
    pub state: StreamState,
}

impl StreamObservation {
    /// Decode the first entry of the `stream` section.
    pub fn from_frame(frame: &Value) -> Result<Option<Self>, DecodeError> {
        let Some(section) = frame.get("stream") else {
            return Ok(None);
        };
        let streams = Vec::<RawStream>::deserialize(section)?;
        let Some(raw) = streams.into_iter().next() else {
            return Ok(None);
        };
        let state = StreamState::from_u8(raw.state).ok_or(DecodeError::InvalidField {
            field: "stream.state",
            value: i64::from(raw.state),
        })?;
        Ok(Some(Self {
            capacity: raw.capacity,
            queued: raw.queued,
            tag: raw.tag,
            state,
        }))
    }
}

#[derive(Deserialize)]
struct RawStream {
    capacity: i32,
    #[serde(default)]
    queued: i32,
    state: u8,
    tag: u64,
}

// ─── Telemetry ──────────────────────────────────────────────────────

/// Joint positions, velocities and torques at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct JointStates {
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
    pub torques: Vec<f64>,
}

/// Latest commanded (`set`) and measured (`actual`) joint states.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub set: JointStates,
    pub actual: JointStates,
}

impl TelemetrySnapshot {
    /// Decode the newest frame of the `telemetry` section.
    pub fn from_frame(frame: &Value) -> Result<Option<Self>, DecodeError> {
        let Some(section) = frame.get("telemetry") else {
            return Ok(None);
        };
        let frames = Vec::<RawTelemetry>::deserialize(section)?;
        Ok(frames.into_iter().last().map(|raw| Self {
            set: RawJoint::collect(raw.set),
            actual: RawJoint::collect(raw.act),
        }))
    }
}

#[derive(Deserialize)]
struct RawTelemetry {
    #[serde(default)]
    set: Vec<RawJoint>,
    #[serde(default)]
    act: Vec<RawJoint>,
}

#[derive(Deserialize)]
struct RawJoint {
    p: f64,
    #[serde(default)]
    v: f64,
    #[serde(default)]
    t: f64,
}

impl RawJoint {
    fn collect(joints: Vec<RawJoint>) -> JointStates {
        let mut states = JointStates::default();
        for joint in joints {
            states.positions.push(joint.p);
            states.velocities.push(joint.v);
            states.torques.push(joint.t);
        }
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_decodes_machine_and_kinematics() {
        let frame = json!({
            "status": {
                "machine": {
                    "statusWord": 0x27,
                    "heartbeat": 42,
                    "operationError": 1,
                    "operationErrorMessage": "heartbeat lost",
                    "target": 2
                },
                "kc": [{"limitsDisabled": true, "froTarget": 0.5, "froActual": 0.4}],
                "dout": [{"effectiveValue": true}, {"effectiveValue": false}],
                "iout": [{"effectiveValue": 7}]
            }
        });
        let status = StatusObservation::from_frame(&frame).unwrap().unwrap();
        assert_eq!(status.power_state(), PowerState::OperationEnabled);
        assert_eq!(status.heartbeat_echo, 42);
        assert_eq!(status.operation_error, OperationError::HeartbeatLost);
        assert_eq!(status.target, MachineTarget::Simulation);
        assert!(status.kinematics_limits_disabled);
        assert_eq!(status.feed_rate_actual, 0.4);
        assert_eq!(status.digital_outputs, vec![true, false]);
        assert_eq!(status.integer_outputs, vec![7]);
    }

    #[test]
    fn status_tolerates_null_heartbeat_and_missing_lists() {
        let frame = json!({"status": {"machine": {"statusWord": 64, "heartbeat": null}}});
        let status = StatusObservation::from_frame(&frame).unwrap().unwrap();
        assert_eq!(status.heartbeat_echo, 0);
        assert_eq!(status.power_state(), PowerState::SwitchOnDisabled);
        assert!(status.digital_outputs.is_empty());
    }

    #[test]
    fn absent_section_is_not_an_error() {
        let frame = json!({"telemetry": []});
        assert!(StatusObservation::from_frame(&frame).unwrap().is_none());
        assert!(StreamObservation::from_frame(&frame).unwrap().is_none());
        assert!(TelemetrySnapshot::from_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn malformed_status_is_an_error() {
        let frame = json!({"status": {"machine": {"statusWord": "enabled"}}});
        assert!(StatusObservation::from_frame(&frame).is_err());
    }

    #[test]
    fn stream_uses_first_entry() {
        let frame = json!({"stream": [
            {"capacity": 20, "queued": 3, "state": 1, "tag": 5},
            {"capacity": 1, "queued": 0, "state": 0, "tag": 0}
        ]});
        let stream = StreamObservation::from_frame(&frame).unwrap().unwrap();
        assert_eq!(stream.capacity, 20);
        assert_eq!(stream.queued, 3);
        assert_eq!(stream.state, StreamState::Active);
        assert_eq!(stream.tag, 5);
    }

    #[test]
    fn unknown_stream_state_is_rejected() {
        let frame = json!({"stream": [{"capacity": 20, "state": 9, "tag": 0}]});
        assert!(matches!(
            StreamObservation::from_frame(&frame),
            Err(DecodeError::InvalidField { field: "stream.state", value: 9 })
        ));
    }

    #[test]
    fn telemetry_keeps_newest_frame() {
        let frame = json!({"telemetry": [
            {"set": [{"p": 0.0}], "act": [{"p": 0.0}]},
            {"set": [{"p": 1.0, "v": 0.1, "t": 2.0}, {"p": 2.0}], "act": [{"p": 0.9, "v": 0.1}]}
        ]});
        let snapshot = TelemetrySnapshot::from_frame(&frame).unwrap().unwrap();
        assert_eq!(snapshot.set.positions, vec![1.0, 2.0]);
        assert_eq!(snapshot.set.torques, vec![2.0, 0.0]);
        assert_eq!(snapshot.actual.positions, vec![0.9]);
    }

    #[test]
    fn operation_error_codes() {
        assert_eq!(OperationError::from_code(0), OperationError::None);
        assert_eq!(OperationError::from_code(14), OperationError::JointLimitExceeded);
        assert_eq!(OperationError::from_code(99), OperationError::Unrecognized);
        assert!(!OperationError::None.is_error());
    }
}
