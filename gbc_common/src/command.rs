//! Commands accepted by the machine and stream controllers.
//!
//! [`Command`] is a closed sum type. Each variant declares which controller
//! handles it ([`Route`]) and how the scheduler drives it ([`TaskKind`]);
//! validating constructors reject bad parameters before anything is queued.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cia402::PowerState;
use crate::consts::{MAX_HEARTBEAT_HZ, MAX_SERIAL_BYTES};
use crate::error::ClientError;
use crate::observation::MachineTarget;
use crate::task::TaskKind;

// ─── Geometry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Cartesian target: position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Position,
    pub orientation: Quaternion,
}

impl Pose {
    pub const fn new(position: Position, orientation: Quaternion) -> Self {
        Self {
            position,
            orientation,
        }
    }

    fn validate(&self) -> Result<(), ClientError> {
        let p = &self.position;
        let q = &self.orientation;
        let finite = [p.x, p.y, p.z, q.x, q.y, q.z, q.w]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(bad("pose coordinates must be finite"));
        }
        if q.norm() == 0.0 {
            return Err(bad("orientation quaternion must be non-zero"));
        }
        Ok(())
    }
}

/// How a `MoveToPosition` target is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum PositionReference {
    #[default]
    Absolute = 0,
    Relative = 1,
    MoveSuperimposed = 2,
}

/// Stream run control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamCommandType {
    Run = 0,
    Pause = 1,
    Stop = 2,
}

/// Controller a command is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Machine,
    Stream,
}

// ─── Command ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Echo the controller's heartbeat counter every `period`.
    Heartbeat { period: Duration },
    /// Drive the CiA 402 state machine until `goal` is reported.
    SetPowerState { goal: PowerState },
    SetKinematicsLimit { disable: bool },
    /// Feed rate override, 1.0 = 100 %.
    SetFeedRate { value: f64 },
    SetMachineTarget { target: MachineTarget },
    SetDigitalOutput { index: u32, value: bool, override_output: bool },
    SetAnalogOutput { index: u32, value: f64, override_output: bool },
    SetIntegerOutput { index: u32, value: i64, override_output: bool },
    SendSerial { data: Vec<u8> },
    MoveJoints { positions: Vec<f64> },
    MoveJointsInterpolated { positions: Vec<f64>, velocities: Vec<f64>, duration: f64 },
    MoveLine { pose: Pose },
    MoveToPosition { pose: Pose, reference: PositionReference },
    StreamControl(StreamCommandType),
}

fn bad(msg: impl Into<String>) -> ClientError {
    ClientError::BadArgument(msg.into())
}

fn finite_joints(values: &[f64], what: &str) -> Result<(), ClientError> {
    if values.is_empty() {
        return Err(bad(format!("{what} cannot be empty")));
    }
    if !values.iter().all(|v| v.is_finite()) {
        return Err(bad(format!("{what} must be finite")));
    }
    Ok(())
}

impl Command {
    pub fn heartbeat(frequency_hz: u32) -> Result<Self, ClientError> {
        if !(1..=MAX_HEARTBEAT_HZ).contains(&frequency_hz) {
            return Err(bad(format!(
                "heartbeat frequency must be in 1..={MAX_HEARTBEAT_HZ} Hz, got {frequency_hz}"
            )));
        }
        Ok(Self::Heartbeat {
            period: Duration::from_secs_f64(1.0 / f64::from(frequency_hz)),
        })
    }

    pub const fn set_power_state(goal: PowerState) -> Self {
        Self::SetPowerState { goal }
    }

    pub fn set_feed_rate(value: f64) -> Result<Self, ClientError> {
        if !value.is_finite() || value < 0.0 {
            return Err(bad(format!("feed rate must be a non-negative number, got {value}")));
        }
        Ok(Self::SetFeedRate { value })
    }

    pub fn set_analog_output(index: u32, value: f64, override_output: bool) -> Result<Self, ClientError> {
        if !value.is_finite() {
            return Err(bad("analog output value must be finite"));
        }
        Ok(Self::SetAnalogOutput {
            index,
            value,
            override_output,
        })
    }

    pub fn send_serial(data: Vec<u8>) -> Result<Self, ClientError> {
        if data.len() > MAX_SERIAL_BYTES {
            return Err(bad(format!(
                "serial payload is {} bytes, limit is {MAX_SERIAL_BYTES}",
                data.len()
            )));
        }
        Ok(Self::SendSerial { data })
    }

    pub fn move_joints(positions: Vec<f64>) -> Result<Self, ClientError> {
        finite_joints(&positions, "joint positions")?;
        Ok(Self::MoveJoints { positions })
    }

    pub fn move_joints_interpolated(
        positions: Vec<f64>,
        velocities: Vec<f64>,
        duration: f64,
    ) -> Result<Self, ClientError> {
        finite_joints(&positions, "joint positions")?;
        finite_joints(&velocities, "joint velocities")?;
        if positions.len() != velocities.len() {
            return Err(bad(format!(
                "{} positions but {} velocities",
                positions.len(),
                velocities.len()
            )));
        }
        if !duration.is_finite() || duration <= 0.0 {
            return Err(bad(format!("interpolation duration must be positive, got {duration}")));
        }
        Ok(Self::MoveJointsInterpolated {
            positions,
            velocities,
            duration,
        })
    }

    pub fn move_line(pose: Pose) -> Result<Self, ClientError> {
        pose.validate()?;
        Ok(Self::MoveLine { pose })
    }

    pub fn move_to_position(pose: Pose, reference: PositionReference) -> Result<Self, ClientError> {
        pose.validate()?;
        Ok(Self::MoveToPosition { pose, reference })
    }

    /// Controller that owns this command.
    pub const fn route(&self) -> Route {
        match self {
            Self::Heartbeat { .. }
            | Self::SetPowerState { .. }
            | Self::SetKinematicsLimit { .. }
            | Self::SetFeedRate { .. }
            | Self::SetMachineTarget { .. }
            | Self::SetDigitalOutput { .. }
            | Self::SetAnalogOutput { .. }
            | Self::SetIntegerOutput { .. }
            | Self::SendSerial { .. } => Route::Machine,
            Self::MoveJoints { .. }
            | Self::MoveJointsInterpolated { .. }
            | Self::MoveLine { .. }
            | Self::MoveToPosition { .. }
            | Self::StreamControl(_) => Route::Stream,
        }
    }

    /// How the scheduler drives this command.
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Heartbeat { .. } => TaskKind::Periodic,
            Self::SetPowerState { .. }
            | Self::MoveJoints { .. }
            | Self::MoveJointsInterpolated { .. }
            | Self::MoveLine { .. }
            | Self::MoveToPosition { .. } => TaskKind::PeriodicUntilDone,
            Self::SetKinematicsLimit { .. }
            | Self::SetFeedRate { .. }
            | Self::SetMachineTarget { .. }
            | Self::SetDigitalOutput { .. }
            | Self::SetAnalogOutput { .. }
            | Self::SetIntegerOutput { .. }
            | Self::SendSerial { .. }
            | Self::StreamControl(_) => TaskKind::OneTime,
        }
    }

    /// Short name used in logs and task labels.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::SetPowerState { .. } => "set_power_state",
            Self::SetKinematicsLimit { .. } => "set_kinematics_limit",
            Self::SetFeedRate { .. } => "set_feed_rate",
            Self::SetMachineTarget { .. } => "set_machine_target",
            Self::SetDigitalOutput { .. } => "set_digital_output",
            Self::SetAnalogOutput { .. } => "set_analog_output",
            Self::SetIntegerOutput { .. } => "set_integer_output",
            Self::SendSerial { .. } => "send_serial",
            Self::MoveJoints { .. } => "move_joints",
            Self::MoveJointsInterpolated { .. } => "move_joints_interpolated",
            Self::MoveLine { .. } => "move_line",
            Self::MoveToPosition { .. } => "move_to_position",
            Self::StreamControl(StreamCommandType::Run) => "stream_run",
            Self::StreamControl(StreamCommandType::Pause) => "stream_pause",
            Self::StreamControl(StreamCommandType::Stop) => "stream_stop",
        }
    }

    /// True for motion activities that occupy a stream slot.
    #[inline]
    pub const fn is_motion(&self) -> bool {
        matches!(self.route(), Route::Stream) && !matches!(self, Self::StreamControl(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_period_from_frequency() {
        let Command::Heartbeat { period } = Command::heartbeat(4).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(period, Duration::from_millis(250));
        assert!(Command::heartbeat(0).is_err());
        assert!(Command::heartbeat(MAX_HEARTBEAT_HZ + 1).is_err());
    }

    #[test]
    fn feed_rate_rejects_non_finite() {
        assert!(Command::set_feed_rate(0.5).is_ok());
        assert!(matches!(Command::set_feed_rate(f64::NAN), Err(ClientError::BadArgument(_))));
        assert!(Command::set_feed_rate(-1.0).is_err());
    }

    #[test]
    fn interpolated_move_validation() {
        assert!(Command::move_joints_interpolated(vec![0.0; 6], vec![0.0; 6], 0.1).is_ok());
        assert!(Command::move_joints_interpolated(vec![0.0; 6], vec![0.0; 5], 0.1).is_err());
        assert!(Command::move_joints_interpolated(vec![0.0; 6], vec![0.0; 6], 0.0).is_err());
        assert!(Command::move_joints(vec![]).is_err());
    }

    #[test]
    fn pose_validation() {
        let ok = Pose::new(Position::new(0.4, 0.0, 0.3), Quaternion::IDENTITY);
        assert!(Command::move_line(ok).is_ok());
        let zero_q = Pose::new(Position::default(), Quaternion::new(0.0, 0.0, 0.0, 0.0));
        assert!(Command::move_line(zero_q).is_err());
        let nan = Pose::new(Position::new(f64::NAN, 0.0, 0.0), Quaternion::IDENTITY);
        assert!(Command::move_to_position(nan, PositionReference::Relative).is_err());
    }

    #[test]
    fn serial_payload_limit() {
        assert!(Command::send_serial(vec![0; MAX_SERIAL_BYTES]).is_ok());
        assert!(Command::send_serial(vec![0; MAX_SERIAL_BYTES + 1]).is_err());
    }

    #[test]
    fn routing_and_kinds() {
        let heartbeat = Command::heartbeat(1).unwrap();
        assert_eq!(heartbeat.route(), Route::Machine);
        assert_eq!(heartbeat.kind(), TaskKind::Periodic);

        let enable = Command::set_power_state(PowerState::OperationEnabled);
        assert_eq!(enable.kind(), TaskKind::PeriodicUntilDone);

        let limits = Command::SetKinematicsLimit { disable: true };
        assert_eq!(limits.kind(), TaskKind::OneTime);

        let stop = Command::StreamControl(StreamCommandType::Stop);
        assert_eq!(stop.route(), Route::Stream);
        assert_eq!(stop.kind(), TaskKind::OneTime);
        assert!(!stop.is_motion());

        let line = Command::move_line(Pose::default()).unwrap();
        assert_eq!(line.kind(), TaskKind::PeriodicUntilDone);
        assert!(line.is_motion());
        assert_eq!(line.name(), "move_line");
    }
}
