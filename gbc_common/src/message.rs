//! Wire payload builders.
//!
//! Pure functions from typed command fields to the controller's JSON
//! dialect. Machine-level commands are wrapped as
//! `{"command": {<object>: {"<index>": {"command": {...}}}}}`; motion
//! activities are wrapped in a stream envelope carrying the dispatch tag.

use serde_json::{Value, json};

use crate::command::{Command, Pose, PositionReference, StreamCommandType};
use crate::consts::{
    ACTIVITY_MOVE_JOINTS, ACTIVITY_MOVE_JOINTS_INTERPOLATED, ACTIVITY_MOVE_LINE,
    ACTIVITY_MOVE_TO_POSITION,
};
use crate::error::StepError;
use crate::observation::MachineTarget;

/// Object indices every payload is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageBuilder {
    pub machine: u32,
    pub kinematics_configuration: u32,
    pub stream: u32,
}

impl MessageBuilder {
    pub const fn new(machine: u32, kinematics_configuration: u32, stream: u32) -> Self {
        Self {
            machine,
            kinematics_configuration,
            stream,
        }
    }

    fn command(object: &str, index: u32, body: Value) -> Value {
        json!({ "command": { object: { (index.to_string()): { "command": body } } } })
    }

    pub fn control_word(&self, control_word: u16) -> Value {
        Self::command("machine", self.machine, json!({ "controlWord": control_word }))
    }

    pub fn heartbeat(&self, echo: u64) -> Value {
        Self::command("machine", self.machine, json!({ "heartbeat": echo }))
    }

    pub fn machine_target(&self, target: MachineTarget) -> Value {
        Self::command("machine", self.machine, json!({ "target": target as u8 }))
    }

    pub fn disable_limits(&self, disable: bool) -> Value {
        Self::command(
            "kinematicsConfiguration",
            self.kinematics_configuration,
            json!({ "disableLimits": disable }),
        )
    }

    pub fn feed_rate(&self, value: f64) -> Value {
        Self::command(
            "kinematicsConfiguration",
            self.kinematics_configuration,
            json!({ "fro": value }),
        )
    }

    pub fn digital_output(&self, index: u32, value: bool, override_output: bool) -> Value {
        Self::command("dout", index, json!({ "setValue": value, "override": override_output }))
    }

    pub fn analog_output(&self, index: u32, value: f64, override_output: bool) -> Value {
        Self::command("aout", index, json!({ "setValue": value, "override": override_output }))
    }

    pub fn integer_output(&self, index: u32, value: i64, override_output: bool) -> Value {
        Self::command("iout", index, json!({ "setValue": value, "override": override_output }))
    }

    pub fn serial(&self, data: &[u8]) -> Value {
        Self::command("serial", 0, json!({ "data": data, "length": data.len() }))
    }

    pub fn stream_command(&self, command: StreamCommandType) -> Value {
        Self::command("stream", self.stream, json!({ "streamCommand": command as u8 }))
    }

    /// Stream envelope around a single tagged activity.
    pub fn activity(&self, command: &Command, tag: u64) -> Result<Value, StepError> {
        let kc = self.kinematics_configuration;
        let item = match command {
            Command::MoveJoints { positions } => json!({
                "activityType": ACTIVITY_MOVE_JOINTS,
                "tag": tag,
                "moveJoints": {
                    "moveParams": {},
                    "kinematicsConfigurationIndex": kc,
                    "jointPositionArray": positions,
                },
            }),
            Command::MoveJointsInterpolated {
                positions,
                velocities,
                duration,
            } => json!({
                "activityType": ACTIVITY_MOVE_JOINTS_INTERPOLATED,
                "tag": tag,
                "moveJointsInterpolated": {
                    "kinematicsConfigurationIndex": kc,
                    "duration": duration,
                    "jointPositionArray": positions,
                    "jointVelocityArray": velocities,
                },
            }),
            Command::MoveLine { pose } => json!({
                "activityType": ACTIVITY_MOVE_LINE,
                "tag": tag,
                "moveLine": {
                    "moveParams": {},
                    "kinematicsConfigurationIndex": kc,
                    "line": pose_json(pose),
                },
            }),
            Command::MoveToPosition { pose, reference } => json!({
                "activityType": ACTIVITY_MOVE_TO_POSITION,
                "tag": tag,
                "moveToPosition": {
                    "moveParams": {},
                    "kinematicsConfigurationIndex": kc,
                    "cartesianPosition": pose_json(pose),
                    "positionReference": reference_code(*reference),
                },
            }),
            other => {
                return Err(StepError::Payload(format!(
                    "{} is not a stream activity",
                    other.name()
                )));
            }
        };
        Ok(json!({
            "stream": {
                "streamIndex": self.stream,
                "items": [item],
                "name": "default",
                "enableEndProgram": false,
            }
        }))
    }

    /// Payload for every command that needs no runtime context.
    ///
    /// Heartbeats and power-state transitions depend on the latest
    /// observation and go through [`heartbeat`](Self::heartbeat) and
    /// [`control_word`](Self::control_word) instead; motion activities need a
    /// tag and go through [`activity`](Self::activity).
    pub fn build(&self, command: &Command) -> Result<Value, StepError> {
        Ok(match command {
            Command::SetKinematicsLimit { disable } => self.disable_limits(*disable),
            Command::SetFeedRate { value } => self.feed_rate(*value),
            Command::SetMachineTarget { target } => self.machine_target(*target),
            Command::SetDigitalOutput {
                index,
                value,
                override_output,
            } => self.digital_output(*index, *value, *override_output),
            Command::SetAnalogOutput {
                index,
                value,
                override_output,
            } => self.analog_output(*index, *value, *override_output),
            Command::SetIntegerOutput {
                index,
                value,
                override_output,
            } => self.integer_output(*index, *value, *override_output),
            Command::SendSerial { data } => self.serial(data),
            Command::StreamControl(kind) => self.stream_command(*kind),
            other => {
                return Err(StepError::Payload(format!(
                    "{} needs runtime context",
                    other.name()
                )));
            }
        })
    }
}

fn pose_json(pose: &Pose) -> Value {
    let p = pose.position;
    let q = pose.orientation;
    json!({
        "position": { "x": p.x, "y": p.y, "z": p.z },
        "orientation": { "x": q.x, "y": q.y, "z": q.z, "w": q.w },
    })
}

fn reference_code(reference: PositionReference) -> u8 {
    reference as u8
}
