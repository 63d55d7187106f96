//! # GBC Client Binary
//!
//! Command-line front end for a GBC motion controller.
//!
//! # Usage
//!
//! ```bash
//! # Enable the drive on a local controller
//! gbc_client enable
//!
//! # Remote controller, verbose, JSON logs
//! gbc_client --url ws://10.0.0.12:9001/ws -v --json enable
//!
//! # Keep the connection alive until Ctrl-C
//! gbc_client --config config/client.toml heartbeat
//!
//! # Linear move, then stop the stream
//! gbc_client move-line 0.3 0.0 0.5
//! gbc_client stream stop
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gbc_client::Robot;
use gbc_common::command::{Pose, Position, Quaternion};
use gbc_common::config::{ClientConfig, ConfigError, ConfigLoader};
use gbc_common::error::ClientError;
use gbc_common::observation::MachineTarget;

/// GBC client - CiA 402 power control, heartbeat and motion streaming
#[derive(Parser, Debug)]
#[command(name = "gbc_client")]
#[command(version)]
#[command(about = "Control-plane client for GBC motion controllers")]
#[command(long_about = None)]
struct Args {
    /// Path to the client configuration TOML
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Controller websocket URL (overrides connection.url)
    #[arg(long)]
    url: Option<String>,

    /// Seconds to wait for each operation (overrides api.default_timeout_s)
    #[arg(long)]
    timeout: Option<f64>,

    /// Enable verbose logging (DEBUG level)
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Echo the controller heartbeat until interrupted
    Heartbeat,
    /// Drive the machine to OPERATION_ENABLED
    Enable,
    /// Send a zero control word (SWITCH_ON_DISABLED)
    Disable,
    /// Start the heartbeat and return to SWITCH_ON_DISABLED
    Reset,
    /// Feed rate override, 1.0 = 100 %
    Speed { value: f64 },
    /// Switch the kinematics safety limits
    Limits { state: Toggle },
    /// Select the machine target
    Target { target: TargetArg },
    /// Set a digital output
    Dout {
        index: u32,
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
        /// Override the output regardless of program control
        #[arg(long = "override")]
        override_output: bool,
    },
    /// Joint-space move to absolute joint positions (rad)
    MoveJoints {
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        positions: Vec<f64>,
    },
    /// Linear move to a Cartesian pose
    MoveLine {
        #[arg(allow_negative_numbers = true)]
        x: f64,
        #[arg(allow_negative_numbers = true)]
        y: f64,
        #[arg(allow_negative_numbers = true)]
        z: f64,
        /// Orientation quaternion as qx,qy,qz,qw
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        orientation: Option<Vec<f64>>,
    },
    /// Control the activity stream
    Stream { action: StreamAction },
    /// Print the latest status, stream and power state
    Status {
        /// Keep printing every second until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TargetArg {
    Fieldbus,
    Simulation,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StreamAction {
    Run,
    Pause,
    Stop,
}

fn main() {
    let args = Args::parse();
    let config = load_config(&args);
    let level = match &config {
        Ok(config) if !args.verbose => config.shared.log_level.as_filter(),
        _ if args.verbose => "debug",
        _ => "info",
    };
    setup_tracing(&args, level);

    info!("GBC client v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = config
        .map_err(ClientError::from)
        .and_then(|config| run(&args, config));
    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<ClientConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = &args.url {
        config.connection.url = url.clone();
    }
    if let Some(timeout) = args.timeout {
        config.api.default_timeout_s = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args, config: ClientConfig) -> Result<(), ClientError> {
    let timeout = config.api.default_timeout();
    let mut robot = Robot::connect(config)?;
    robot.start()?;

    let result = execute(&robot, &args.command, timeout);
    robot.shutdown();
    result
}

fn execute(robot: &Robot, action: &Action, timeout: Duration) -> Result<(), ClientError> {
    robot.wait_connected(timeout)?;
    robot.start_heartbeat()?;

    let verdict = match action {
        Action::Heartbeat => {
            wait_for_interrupt(|| info!(power_state = ?robot.power_state(), "heartbeat running"))?;
            return Ok(());
        }
        Action::Status { watch } => {
            print_status(robot);
            if *watch {
                wait_for_interrupt(|| print_status(robot))?;
            }
            return Ok(());
        }
        Action::Enable => robot.enable()?,
        Action::Disable => robot.disable()?,
        Action::Reset => robot.reset()?,
        Action::Speed { value } => robot.set_speed(*value)?,
        Action::Limits { state } => robot.set_safe_limits(matches!(state, Toggle::On))?,
        Action::Target { target } => robot.set_machine_target(match target {
            TargetArg::Fieldbus => MachineTarget::Fieldbus,
            TargetArg::Simulation => MachineTarget::Simulation,
        })?,
        Action::Dout {
            index,
            value,
            override_output,
        } => robot.set_digital_output(*index, *value, *override_output)?,
        Action::MoveJoints { positions } => robot.move_joints(positions.clone())?,
        Action::MoveLine { x, y, z, orientation } => {
            let orientation = match orientation.as_deref() {
                Some([qx, qy, qz, qw]) => Quaternion::new(*qx, *qy, *qz, *qw),
                Some(other) => {
                    return Err(ClientError::BadArgument(format!(
                        "orientation needs 4 components, got {}",
                        other.len()
                    )));
                }
                None => Quaternion::IDENTITY,
            };
            robot.move_line(Pose::new(Position::new(*x, *y, *z), orientation))?
        }
        Action::Stream { action } => match action {
            StreamAction::Run => robot.run_stream()?,
            StreamAction::Pause => robot.pause_stream()?,
            StreamAction::Stop => robot.stop_stream()?,
        },
    };
    info!(?verdict, "done");
    Ok(())
}

/// Call `tick` once a second until Ctrl-C.
fn wait_for_interrupt(mut tick: impl FnMut()) -> Result<(), ClientError> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| ClientError::Transport(format!("cannot install signal handler: {e}")))?;

    let mut elapsed = Duration::ZERO;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        elapsed += Duration::from_millis(100);
        if elapsed >= Duration::from_secs(1) {
            elapsed = Duration::ZERO;
            tick();
        }
    }
    Ok(())
}

fn print_status(robot: &Robot) {
    match robot.status() {
        Some(status) => println!(
            "power state: {}  status word: {:#06x}  heartbeat: {}  error: {:?}  fro: {:.2}/{:.2}  target: {:?}",
            robot
                .power_state()
                .map_or_else(|| "-".to_string(), |s| s.to_string()),
            status.machine_status_word,
            status.heartbeat_echo,
            status.operation_error,
            status.feed_rate_target,
            status.feed_rate_actual,
            status.target,
        ),
        None => warn!("no status received yet"),
    }
    if let Some(stream) = robot.stream_status() {
        println!(
            "stream: {:?}  capacity: {}  queued: {}  tag: {}",
            stream.state, stream.capacity, stream.queued, stream.tag
        );
    }
    if let Some(telemetry) = robot.telemetry() {
        println!("joints: {:?}", telemetry.actual.positions);
    }
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
