//! Machine controller: heartbeat, CiA 402 power-state transitions and
//! machine-level configuration commands.
//!
//! At most one power-state transition runs at a time; a second one waits at
//! the head of the queue until the first has exited. The working control word
//! persists across transitions, seeded from configuration.
//!
//! Steps act only on status observed on the current connection: after a
//! reconnect the heartbeat and any running transition hold until the first
//! fresh status frame arrives.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use gbc_common::cia402::{PowerState, decode_state, next_control_word};
use gbc_common::command::{Command, Route};
use gbc_common::config::MachineConfig;
use gbc_common::error::ClientError;
use gbc_common::message::MessageBuilder;
use gbc_common::observation::StatusObservation;
use gbc_common::task::Verdict;

use super::{CommandQueue, Pending, ServiceSlot};
use crate::observer::ObservationSink;
use crate::scheduler::Spawner;
use crate::scheduler::task::{ReconciliationTask, StepFn, TaskHandle};
use crate::transport::{ConnectionState, ConnectionWatch, Link};

/// Gate for a queued machine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MachineGate {
    /// Starts as soon as it reaches the head of the queue.
    Free,
    /// Power-state transition: waits for the previous one to exit.
    Exclusive,
}

/// CiA 402 session state carried across ticks and commands.
#[derive(Debug, Clone)]
struct Session {
    control_word: u16,
    /// A fault reset has been sent during the current fault episode.
    fault_reset_issued: bool,
    heartbeats_sent: u64,
    last_heartbeat: Option<Instant>,
}

struct Inner {
    link: Link,
    status: ObservationSink<StatusObservation>,
    spawner: Spawner,
    builder: MessageBuilder,
    power_state_period: Duration,
    tick: Duration,
    observation_retry: Duration,
    queue: CommandQueue<MachineGate>,
    session: Arc<Mutex<Session>>,
    power_task: Mutex<Option<TaskHandle>>,
}

pub struct MachineController {
    inner: Arc<Inner>,
    service: ServiceSlot,
}

impl MachineController {
    pub fn new(
        config: &MachineConfig,
        builder: MessageBuilder,
        link: Link,
        status: ObservationSink<StatusObservation>,
        spawner: Spawner,
    ) -> Self {
        let session = Session {
            control_word: config.initial_control_word,
            fault_reset_issued: false,
            heartbeats_sent: 0,
            last_heartbeat: None,
        };
        Self {
            inner: Arc::new(Inner {
                link,
                status,
                spawner,
                builder,
                power_state_period: config.power_state_period(),
                tick: config.tick(),
                observation_retry: config.observation_retry(),
                queue: CommandQueue::new(),
                session: Arc::new(Mutex::new(session)),
                power_task: Mutex::new(None),
            }),
            service: ServiceSlot::default(),
        }
    }

    /// Start the controller loop on the scheduler runtime.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let spawner = self.inner.spawner.clone();
        if self.service.start(|| spawner.spawn_service(run(inner))) {
            info!("machine controller started");
        }
    }

    /// Stop the loop. Queued tasks stay queued; running tasks keep running.
    pub fn stop(&self) {
        if self.service.stop() {
            info!("machine controller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    /// Queue `command` behind everything already queued.
    pub fn schedule_last(&self, command: Command) -> Result<TaskHandle, ClientError> {
        let pending = self.build(command)?;
        Ok(self.inner.queue.push_back(pending))
    }

    /// Queue `command` ahead of everything already queued.
    pub fn schedule_first(&self, command: Command) -> Result<TaskHandle, ClientError> {
        let pending = self.build(command)?;
        Ok(self.inner.queue.push_front(pending))
    }

    /// Cancel every queued, not yet started task.
    pub fn clear_queue(&self) -> usize {
        self.inner.queue.cancel_all()
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Last control word sent (or the seed before the first transition).
    pub fn control_word(&self) -> u16 {
        self.inner.session.lock().control_word
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.inner.session.lock().heartbeats_sent
    }

    fn build(&self, command: Command) -> Result<Pending<MachineGate>, ClientError> {
        if command.route() != Route::Machine {
            return Err(ClientError::BadArgument(format!(
                "{} is not a machine command",
                command.name()
            )));
        }
        let inner = &self.inner;
        let label = command.name();
        let kind = command.kind();
        let (period, gate, step): (Duration, MachineGate, StepFn) = match command {
            Command::Heartbeat { period } => (period, MachineGate::Free, heartbeat_step(inner)),
            Command::SetPowerState { goal } => (
                inner.power_state_period,
                MachineGate::Exclusive,
                power_state_step(inner, goal),
            ),
            other => {
                let payload = inner
                    .builder
                    .build(&other)
                    .map_err(|e| ClientError::BadArgument(e.to_string()))?;
                let step: StepFn = Box::new(move |outbox| {
                    outbox.push(payload.clone());
                    Ok(Verdict::Success)
                });
                (Duration::ZERO, MachineGate::Free, step)
            }
        };
        debug!(label, ?kind, "machine command scheduled");
        let task = ReconciliationTask::new(label, kind, period, inner.link.outbound.clone(), step);
        Ok(Pending::new(task, gate))
    }
}

impl Drop for MachineController {
    fn drop(&mut self) {
        self.service.stop();
    }
}

// ─── Steps ──────────────────────────────────────────────────────────

fn heartbeat_step(inner: &Inner) -> StepFn {
    let status = inner.status.clone();
    let session = Arc::clone(&inner.session);
    let builder = inner.builder;
    Box::new(move |outbox| {
        let Some(observed) = status.latest() else {
            debug!("no status observed yet, heartbeat skipped");
            return Ok(Verdict::Running);
        };
        let echo = observed.value.heartbeat_echo;
        outbox.push(builder.heartbeat(echo));

        let mut session = session.lock();
        let now = Instant::now();
        let since = session.last_heartbeat.map(|t| now.duration_since(t));
        session.last_heartbeat = Some(now);
        session.heartbeats_sent += 1;
        trace!(echo, ?since, "heartbeat");
        Ok(Verdict::Running)
    })
}

fn power_state_step(inner: &Inner, goal: PowerState) -> StepFn {
    let status = inner.status.clone();
    let session = Arc::clone(&inner.session);
    let builder = inner.builder;
    Box::new(move |outbox| {
        let Some(observed) = status.latest() else {
            trace!("waiting for a status observation");
            return Ok(Verdict::Running);
        };
        let mut session = session.lock();

        if goal == PowerState::SwitchOnDisabled {
            session.control_word = 0;
            outbox.push(builder.control_word(0));
            debug!("disable requested, zero control word sent");
            return Ok(Verdict::Success);
        }

        let current = decode_state(observed.value.machine_status_word);
        if current != PowerState::Fault {
            session.fault_reset_issued = false;
        }
        if current == goal {
            debug!(state = %current, "power state reached");
            return Ok(Verdict::Success);
        }

        let next = next_control_word(current, session.control_word, !session.fault_reset_issued);
        if current == PowerState::Fault && !session.fault_reset_issued {
            warn!("drive in FAULT, issuing fault reset");
            session.fault_reset_issued = true;
        }
        debug!(state = %current, goal = %goal, control_word = next, "power state transition");
        session.control_word = next;
        outbox.push(builder.control_word(next));
        Ok(Verdict::Running)
    })
}

// ─── Loop ───────────────────────────────────────────────────────────

async fn run(inner: Arc<Inner>) {
    let mut connection = ConnectionWatch::new(&inner.link);
    loop {
        if connection.poll() {
            info!("connection lost, waiting for fresh status");
            inner.status.expire();
        }
        if connection.state() != ConnectionState::Connected {
            trace!("machine controller waiting for connection");
            tokio::time::sleep(inner.observation_retry).await;
            continue;
        }
        if !inner.status.has_value() {
            warn!("no status observed on this connection yet, retrying in {:?}", inner.observation_retry);
            tokio::time::sleep(inner.observation_retry).await;
            continue;
        }
        dispatch_next(&inner);
        tokio::time::sleep(inner.tick).await;
    }
}

/// Start at most one queued task.
fn dispatch_next(inner: &Inner) {
    let mut power_task = inner.power_task.lock();
    let transition_busy = power_task.as_ref().is_some_and(|h| !h.has_exited());
    let admitted = inner.queue.pop_admitted(|gate| match gate {
        MachineGate::Free => true,
        MachineGate::Exclusive => !transition_busy,
    });
    let Some(pending) = admitted else {
        return;
    };
    if pending.gate == MachineGate::Exclusive {
        *power_task = Some(pending.handle.clone());
    }
    drop(power_task);
    debug!(task = pending.handle.id(), label = pending.handle.label(), "starting machine task");
    inner.spawner.spawn(pending.task);
}
