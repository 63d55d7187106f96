//! Machine controller against a simulated controller on a loopback link.

mod common;

use std::sync::Arc;
use std::time::Duration;

use gbc_client::MachineController;
use gbc_client::observer::StatusObserver;
use gbc_client::scheduler::Spawner;
use gbc_client::transport::{ConnectionState, Subscribers, loopback};
use gbc_common::cia402::PowerState;
use gbc_common::command::Command;
use gbc_common::config::MachineConfig;
use gbc_common::message::MessageBuilder;
use gbc_common::task::{TaskOutcome, Verdict};

use common::{Device, DeviceState};

fn machine(initial: PowerState) -> (MachineController, Device) {
    let (link, end) = loopback(32);
    let subscribers = Subscribers::default();
    let status = StatusObserver::default();
    subscribers.attach(Arc::new(status.clone()));

    let config = MachineConfig {
        power_state_period_ms: 100,
        ..MachineConfig::default()
    };
    let controller = MachineController::new(
        &config,
        MessageBuilder::default(),
        link,
        status.sink().clone(),
        Spawner::current(),
    );
    let device = Device::spawn(end, subscribers, DeviceState::new(initial));
    (controller, device)
}

#[tokio::test(start_paused = true)]
async fn heartbeat_and_enable_end_to_end() {
    let (controller, device) = machine(PowerState::SwitchOnDisabled);
    controller.start();
    let started = tokio::time::Instant::now();

    controller.schedule_first(Command::heartbeat(1).unwrap()).unwrap();
    let enable = controller
        .schedule_last(Command::set_power_state(PowerState::OperationEnabled))
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), enable.wait())
        .await
        .expect("enable did not finish");
    assert_eq!(outcome, TaskOutcome::Done(Verdict::Success));

    let snapshot = device.snapshot();
    assert_eq!(snapshot.power, PowerState::OperationEnabled);
    assert_eq!(snapshot.control_words, vec![0x06, 0x07, 0x0F]);
    // Three transitions plus the confirming step: well inside five periods.
    assert!(started.elapsed() <= Duration::from_millis(5 * 100 + 100));

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let snapshot = device.snapshot();
    let elapsed = started.elapsed().as_secs();
    assert_eq!(snapshot.heartbeats.len() as u64, elapsed + 1);
    assert!(snapshot.heartbeats.iter().all(|(_, echo)| *echo == 1));
    assert!(controller.heartbeats_sent() >= 3);
}

#[tokio::test(start_paused = true)]
async fn fault_is_reset_once_then_enabled() {
    let (controller, device) = machine(PowerState::Fault);
    controller.start();

    let enable = controller
        .schedule_last(Command::set_power_state(PowerState::OperationEnabled))
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), enable.wait())
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Done(Verdict::Success));

    let words = device.snapshot().control_words;
    assert_eq!(words.iter().filter(|cw| **cw & 0x80 != 0).count(), 1);
    assert_eq!(words.first(), Some(&0x80));
    assert_eq!(words.last(), Some(&0x0F));
}

#[tokio::test(start_paused = true)]
async fn disable_is_immediate() {
    let (controller, device) = machine(PowerState::OperationEnabled);
    controller.start();

    let disable = controller
        .schedule_last(Command::set_power_state(PowerState::SwitchOnDisabled))
        .unwrap();
    assert_eq!(disable.wait().await, TaskOutcome::Done(Verdict::Success));
    assert_eq!(controller.control_word(), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(device.snapshot().power, PowerState::SwitchOnDisabled);
}

#[tokio::test(start_paused = true)]
async fn transitions_run_one_at_a_time() {
    let (controller, device) = machine(PowerState::SwitchOnDisabled);
    controller.start();

    let enable = controller
        .schedule_last(Command::set_power_state(PowerState::OperationEnabled))
        .unwrap();
    let disable = controller
        .schedule_last(Command::set_power_state(PowerState::SwitchOnDisabled))
        .unwrap();

    assert_eq!(disable.wait().await, TaskOutcome::Done(Verdict::Success));
    tokio::time::sleep(Duration::from_millis(10)).await;
    // The disable only started once the enable had finished.
    assert_eq!(enable.outcome(), Some(TaskOutcome::Done(Verdict::Success)));
    assert_eq!(device.snapshot().control_words, vec![0x06, 0x07, 0x0F, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn one_time_commands_reach_the_device() {
    let (controller, device) = machine(PowerState::SwitchOnDisabled);
    controller.start();

    let handle = controller
        .schedule_last(Command::set_feed_rate(0.5).unwrap())
        .unwrap();
    assert_eq!(handle.wait().await, TaskOutcome::Done(Verdict::Success));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = device.snapshot().other_commands;
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0]["command"]["kinematicsConfiguration"]["0"]["command"]["fro"],
        0.5
    );
}

#[tokio::test(start_paused = true)]
async fn nothing_is_dispatched_while_disconnected() {
    let (controller, device) = machine(PowerState::SwitchOnDisabled);
    device.connection.send_replace(ConnectionState::Disconnected);
    controller.start();

    let handle = controller
        .schedule_last(Command::SetKinematicsLimit { disable: true })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!handle.is_finished());
    assert_eq!(controller.pending(), 1);

    device.connection.send_replace(ConnectionState::Connected);
    assert_eq!(handle.wait().await, TaskOutcome::Done(Verdict::Success));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_echoes_only_status_from_the_current_connection() {
    let (controller, device) = machine(PowerState::SwitchOnDisabled);
    controller.start();
    controller.schedule_first(Command::heartbeat(1).unwrap()).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!device.snapshot().heartbeats.is_empty());

    device.connection.send_replace(ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(2)).await;

    // New counter on the device, not reported yet.
    device.state.lock().heartbeat_counter = 77;
    device.connection.send_replace(ConnectionState::Connected);
    let held = device.snapshot().heartbeats.len();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(device.snapshot().heartbeats.len(), held);

    device.update(|_| {});
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let heartbeats = device.snapshot().heartbeats;
    assert!(heartbeats.len() > held);
    assert!(heartbeats[held..].iter().all(|&(_, echo)| echo == 77));
}

#[tokio::test(start_paused = true)]
async fn stream_commands_are_refused() {
    let (controller, _device) = machine(PowerState::SwitchOnDisabled);
    let err = controller
        .schedule_last(Command::move_joints(vec![0.0; 6]).unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("not a machine command"));
}
