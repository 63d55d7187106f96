//! Synchronous facade over the scheduler and both controllers.
//!
//! Every call builds a [`Command`], queues it on the owning controller and
//! blocks the calling thread on the task's outcome through
//! [`TaskScheduler::post_and_wait`]. When the deadline passes, the task is
//! cancelled before the call returns [`ClientError::Timeout`].
//!
//! # Example
//!
//! ```rust,no_run
//! use gbc_client::robot::Robot;
//! use gbc_common::config::ClientConfig;
//! use gbc_common::command::{Pose, Position, Quaternion};
//!
//! # fn main() -> Result<(), gbc_common::error::ClientError> {
//! let mut robot = Robot::connect(ClientConfig::default())?;
//! robot.start()?;
//! robot.enable()?;
//! robot.move_line(Pose::new(Position::new(0.3, 0.0, 0.5), Quaternion::IDENTITY))?;
//! robot.shutdown();
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use gbc_common::cia402::{PowerState, decode_state};
use gbc_common::command::{Command, Pose, PositionReference, StreamCommandType};
use gbc_common::config::ClientConfig;
use gbc_common::consts::CANCEL_GRACE;
use gbc_common::error::ClientError;
use gbc_common::message::MessageBuilder;
use gbc_common::observation::{
    MachineTarget, StatusObservation, StreamObservation, TelemetrySnapshot,
};
use gbc_common::task::Verdict;

use crate::controller::{MachineController, StreamController, StreamJob};
use crate::observer::{ObservationSink, StatusObserver, StreamObserver, TelemetryObserver};
use crate::scheduler::TaskScheduler;
use crate::scheduler::task::TaskHandle;
use crate::transport::{ConnectionState, Link, Subscribers, WsTransport};

/// Name of the scheduler thread.
pub const SCHEDULER_THREAD: &str = "gbc-scheduler";

/// One point of an interpolated joint trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryPoint {
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
    /// Seconds to reach this point from the previous one.
    pub duration: f64,
}

pub struct Robot {
    machine: MachineController,
    stream: StreamController,
    transport: Option<WsTransport>,
    status: ObservationSink<StatusObservation>,
    stream_status: ObservationSink<StreamObservation>,
    telemetry: ObservationSink<TelemetrySnapshot>,
    link: Link,
    heartbeat: Mutex<Option<TaskHandle>>,
    heartbeat_frequency_hz: u32,
    default_timeout: Duration,
    // Dropped last: everything above still references its runtime.
    scheduler: TaskScheduler,
}

impl Robot {
    /// Start a scheduler thread and open the websocket connection.
    ///
    /// The connection is retried in the background; calls made before it is
    /// up wait for it within their own timeout.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let scheduler = TaskScheduler::start(SCHEDULER_THREAD)?;
        let subscribers = Subscribers::default();
        let transport = WsTransport::spawn(
            scheduler.spawner(),
            config.connection.url.clone(),
            config.connection.reconnect_interval(),
            config.connection.outbound_capacity,
            subscribers.clone(),
        );
        let link = transport.link();
        info!(url = %config.connection.url, "connecting");
        Ok(Self::assemble(&config, scheduler, link, &subscribers, Some(transport)))
    }

    /// Build a robot on an existing scheduler and link. Inbound frames are
    /// expected on `subscribers`.
    pub fn with_link(
        config: &ClientConfig,
        scheduler: TaskScheduler,
        link: Link,
        subscribers: &Subscribers,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self::assemble(config, scheduler, link, subscribers, None))
    }

    fn assemble(
        config: &ClientConfig,
        scheduler: TaskScheduler,
        link: Link,
        subscribers: &Subscribers,
        transport: Option<WsTransport>,
    ) -> Self {
        let status = StatusObserver::default();
        let stream_status = StreamObserver::default();
        let telemetry = TelemetryObserver::default();
        subscribers.attach(std::sync::Arc::new(status.clone()));
        subscribers.attach(std::sync::Arc::new(stream_status.clone()));
        subscribers.attach(std::sync::Arc::new(telemetry.clone()));

        let builder = MessageBuilder::new(
            config.machine.machine_index,
            config.stream.kinematics_configuration,
            config.stream.stream_index,
        );
        let spawner = scheduler.spawner().clone();
        let machine = MachineController::new(
            &config.machine,
            builder,
            link.clone(),
            status.sink().clone(),
            spawner.clone(),
        );
        let stream = StreamController::new(
            &config.stream,
            builder,
            link.clone(),
            stream_status.sink().clone(),
            spawner,
        );

        Self {
            machine,
            stream,
            transport,
            status: status.sink().clone(),
            stream_status: stream_status.sink().clone(),
            telemetry: telemetry.sink().clone(),
            link,
            heartbeat: Mutex::new(None),
            heartbeat_frequency_hz: config.machine.heartbeat_frequency_hz,
            default_timeout: config.api.default_timeout(),
            scheduler,
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start both controller loops.
    pub fn start(&self) -> Result<(), ClientError> {
        if !self.scheduler.is_running() {
            return Err(ClientError::SchedulerNotRunning);
        }
        self.machine.start();
        self.stream.start();
        Ok(())
    }

    /// Cancel the heartbeat, stop the controllers and the transport, then
    /// join the scheduler thread.
    pub fn shutdown(&mut self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.request_cancel();
        }
        self.machine.clear_queue();
        self.stream.clear_queue();
        self.machine.stop();
        self.stream.stop();
        if let Some(transport) = self.transport.as_mut() {
            transport.stop();
        }
        self.scheduler.stop();
        info!("robot shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Block until the link reports connected.
    pub fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut connection = self.link.connection.clone();
        let connected = self.scheduler.post_and_wait(
            async move {
                connection
                    .wait_for(|state| *state == ConnectionState::Connected)
                    .await
                    .is_ok()
            },
            timeout,
        );
        match connected {
            Ok(true) => Ok(()),
            Ok(false) | Err(ClientError::Timeout { .. }) => Err(ClientError::Disconnected),
            Err(e) => Err(e),
        }
    }

    // ─── Machine ────────────────────────────────────────────────────

    /// Start echoing the controller heartbeat. Idempotent while the
    /// heartbeat task is alive.
    pub fn start_heartbeat(&self) -> Result<TaskHandle, ClientError> {
        let mut heartbeat = self.heartbeat.lock();
        if let Some(handle) = heartbeat.as_ref().filter(|h| !h.has_exited()) {
            return Ok(handle.clone());
        }
        let command = Command::heartbeat(self.heartbeat_frequency_hz)?;
        let handle = self.machine.schedule_first(command)?;
        debug!(task = handle.id(), hz = self.heartbeat_frequency_hz, "heartbeat scheduled");
        *heartbeat = Some(handle.clone());
        Ok(handle)
    }

    pub fn enable(&self) -> Result<Verdict, ClientError> {
        self.enable_with_timeout(self.default_timeout)
    }

    /// Drive the machine to OPERATION_ENABLED.
    pub fn enable_with_timeout(&self, timeout: Duration) -> Result<Verdict, ClientError> {
        self.start_heartbeat()?;
        let handle = self
            .machine
            .schedule_last(Command::set_power_state(PowerState::OperationEnabled))?;
        self.wait_for(handle, timeout)
    }

    pub fn disable(&self) -> Result<Verdict, ClientError> {
        self.disable_with_timeout(self.default_timeout)
    }

    pub fn disable_with_timeout(&self, timeout: Duration) -> Result<Verdict, ClientError> {
        let handle = self
            .machine
            .schedule_last(Command::set_power_state(PowerState::SwitchOnDisabled))?;
        self.wait_for(handle, timeout)
    }

    /// Start the heartbeat and return the machine to SWITCH_ON_DISABLED.
    pub fn reset(&self) -> Result<Verdict, ClientError> {
        self.start_heartbeat()?;
        self.disable()
    }

    /// Feed rate override, 1.0 = 100 %.
    pub fn set_speed(&self, value: f64) -> Result<Verdict, ClientError> {
        self.machine_command(Command::set_feed_rate(value)?)
    }

    /// Enable or disable the kinematics safety limits.
    pub fn set_safe_limits(&self, enabled: bool) -> Result<Verdict, ClientError> {
        self.machine_command(Command::SetKinematicsLimit { disable: !enabled })
    }

    pub fn set_machine_target(&self, target: MachineTarget) -> Result<Verdict, ClientError> {
        self.machine_command(Command::SetMachineTarget { target })
    }

    pub fn set_digital_output(&self, index: u32, value: bool, override_output: bool) -> Result<Verdict, ClientError> {
        self.machine_command(Command::SetDigitalOutput {
            index,
            value,
            override_output,
        })
    }

    pub fn set_analog_output(&self, index: u32, value: f64, override_output: bool) -> Result<Verdict, ClientError> {
        self.machine_command(Command::set_analog_output(index, value, override_output)?)
    }

    pub fn set_integer_output(&self, index: u32, value: i64, override_output: bool) -> Result<Verdict, ClientError> {
        self.machine_command(Command::SetIntegerOutput {
            index,
            value,
            override_output,
        })
    }

    pub fn send_serial(&self, data: Vec<u8>) -> Result<Verdict, ClientError> {
        self.machine_command(Command::send_serial(data)?)
    }

    fn machine_command(&self, command: Command) -> Result<Verdict, ClientError> {
        let handle = self.machine.schedule_last(command)?;
        self.wait_for(handle, self.default_timeout)
    }

    // ─── Motion ─────────────────────────────────────────────────────

    pub fn move_joints(&self, positions: Vec<f64>) -> Result<Verdict, ClientError> {
        self.move_joints_with_timeout(positions, self.default_timeout)
    }

    pub fn move_joints_with_timeout(&self, positions: Vec<f64>, timeout: Duration) -> Result<Verdict, ClientError> {
        self.motion(Command::move_joints(positions)?, timeout)
    }

    pub fn move_joints_interpolated(&self, points: Vec<TrajectoryPoint>) -> Result<Verdict, ClientError> {
        self.move_joints_interpolated_with_timeout(points, self.default_timeout)
    }

    /// Stream a trajectory as one batch. Every point is validated before
    /// anything is queued.
    pub fn move_joints_interpolated_with_timeout(
        &self,
        points: Vec<TrajectoryPoint>,
        timeout: Duration,
    ) -> Result<Verdict, ClientError> {
        let commands = points
            .into_iter()
            .map(|p| Command::move_joints_interpolated(p.positions, p.velocities, p.duration))
            .collect::<Result<Vec<_>, _>>()?;
        self.motion(commands, timeout)
    }

    pub fn move_line(&self, pose: Pose) -> Result<Verdict, ClientError> {
        self.move_line_with_timeout(pose, self.default_timeout)
    }

    pub fn move_line_with_timeout(&self, pose: Pose, timeout: Duration) -> Result<Verdict, ClientError> {
        self.motion(Command::move_line(pose)?, timeout)
    }

    pub fn move_to_position(&self, pose: Pose, reference: PositionReference) -> Result<Verdict, ClientError> {
        self.move_to_position_with_timeout(pose, reference, self.default_timeout)
    }

    pub fn move_to_position_with_timeout(
        &self,
        pose: Pose,
        reference: PositionReference,
        timeout: Duration,
    ) -> Result<Verdict, ClientError> {
        self.motion(Command::move_to_position(pose, reference)?, timeout)
    }

    fn motion(&self, job: impl Into<StreamJob>, timeout: Duration) -> Result<Verdict, ClientError> {
        let handle = self.stream.schedule_last(job)?;
        self.wait_for(handle, timeout)
    }

    /// Stop the stream and drop every motion command not yet sent.
    pub fn stop_stream(&self) -> Result<Verdict, ClientError> {
        self.stream_control(StreamCommandType::Stop)
    }

    pub fn pause_stream(&self) -> Result<Verdict, ClientError> {
        self.stream_control(StreamCommandType::Pause)
    }

    pub fn run_stream(&self) -> Result<Verdict, ClientError> {
        self.stream_control(StreamCommandType::Run)
    }

    fn stream_control(&self, kind: StreamCommandType) -> Result<Verdict, ClientError> {
        let handle = self.stream.schedule_first(Command::StreamControl(kind))?;
        self.wait_for(handle, self.default_timeout)
    }

    // ─── Observations ───────────────────────────────────────────────

    pub fn status(&self) -> Option<StatusObservation> {
        self.status.latest().map(|o| o.value.clone())
    }

    pub fn stream_status(&self) -> Option<StreamObservation> {
        self.stream_status.latest().map(|o| o.value)
    }

    pub fn telemetry(&self) -> Option<TelemetrySnapshot> {
        self.telemetry.latest().map(|o| o.value.clone())
    }

    pub fn power_state(&self) -> Option<PowerState> {
        self.status
            .latest()
            .map(|o| decode_state(o.value.machine_status_word))
    }

    pub fn machine(&self) -> &MachineController {
        &self.machine
    }

    pub fn stream(&self) -> &StreamController {
        &self.stream
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Block on `handle`'s outcome, cancelling the task on timeout.
    fn wait_for(&self, handle: TaskHandle, timeout: Duration) -> Result<Verdict, ClientError> {
        let waiter = handle.clone();
        match self
            .scheduler
            .post_and_wait(async move { waiter.wait().await }, timeout)
        {
            Ok(outcome) => outcome.into_result(handle.label()),
            Err(ClientError::Timeout { after }) => {
                warn!(task = handle.id(), label = handle.label(), ?after, "timed out, cancelling");
                if !handle.cancel_blocking(CANCEL_GRACE) {
                    warn!(task = handle.id(), "task did not exit within {:?}", CANCEL_GRACE);
                }
                Err(ClientError::Timeout { after })
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        if self.scheduler.is_running() {
            self.shutdown();
        }
    }
}
