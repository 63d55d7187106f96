//! Stream controller: capacity-gated dispatch of motion activities.
//!
//! Every dispatched activity carries a tag one above the previous one. The
//! first tag is adopted from the controller's last retired tag, because the
//! device keeps counting across client restarts. An activity is complete when
//! the stream reports its tag as retired and has gone idle.
//!
//! A single command or a batch (a pre-computed trajectory) is the unit of
//! work; only one of them runs at a time. Stream control commands (run,
//! pause, stop) bypass that gate, and a stop also cancels everything still
//! queued and aborts the undispatched remainder of the running unit.
//!
//! A lost connection starts a new epoch: the tag is adopted again from the
//! first stream observation of the new connection, and work dispatched in the
//! old epoch resolves `Failure`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use gbc_common::command::{Command, Route, StreamCommandType};
use gbc_common::config::StreamConfig;
use gbc_common::error::ClientError;
use gbc_common::message::MessageBuilder;
use gbc_common::observation::{StreamObservation, StreamState};
use gbc_common::task::{TaskKind, Verdict};

use super::{CommandQueue, Pending, ServiceSlot};
use crate::observer::{ObservationSink, Observed};
use crate::scheduler::Spawner;
use crate::scheduler::task::{ReconciliationTask, StepFn, TaskHandle};
use crate::transport::{ConnectionState, ConnectionWatch, Link};

/// Unit of work accepted by [`StreamController::schedule_last`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamJob {
    Single(Command),
    /// Trajectory points dispatched as capacity allows, tracked as one task.
    Batch(Vec<Command>),
}

impl From<Command> for StreamJob {
    fn from(command: Command) -> Self {
        Self::Single(command)
    }
}

impl From<Vec<Command>> for StreamJob {
    fn from(commands: Vec<Command>) -> Self {
        Self::Batch(commands)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamGate {
    /// Run/pause/stop: starts as soon as it reaches the head.
    Control,
    /// Motion: waits until no other motion task is running.
    Motion,
}

// ─── Session ────────────────────────────────────────────────────────

/// Tag and capacity bookkeeping for the current connection epoch.
#[derive(Debug, Default)]
pub(crate) struct StreamSession {
    /// Last tag sent; `None` until adopted from the first observation.
    last_tag: Option<u64>,
    /// Items sent against observation `(sequence, count)`; the reported
    /// capacity does not account for them yet.
    sent_against: Option<(u64, i32)>,
    /// A single command is dispatched and not yet retired.
    single_in_flight: bool,
    /// Bumped by every stop request.
    stop_generation: u64,
    /// Bumped by every lost connection.
    epoch: u64,
}

impl StreamSession {
    fn next_tag(&mut self, observed_tag: u64) -> u64 {
        let tag = self.last_tag.unwrap_or(observed_tag) + 1;
        self.last_tag = Some(tag);
        tag
    }

    /// Free slots left, counting items sent since this observation was taken.
    fn available(&self, observed: &Observed<StreamObservation>) -> i32 {
        match self.sent_against {
            Some((sequence, sent)) if sequence == observed.sequence => observed.value.capacity - sent,
            _ => observed.value.capacity,
        }
    }

    fn record_sent(&mut self, sequence: u64) {
        self.sent_against = match self.sent_against {
            Some((seq, sent)) if seq == sequence => Some((seq, sent + 1)),
            _ => Some((sequence, 1)),
        };
    }

    fn reset_epoch(&mut self) {
        self.last_tag = None;
        self.sent_against = None;
        self.single_in_flight = false;
        self.epoch += 1;
    }
}

/// Where and when an activity went out.
#[derive(Debug, Clone, Copy)]
struct Dispatch {
    tag: u64,
    epoch: u64,
    /// Sequence of the observation it was sent against.
    sequence: u64,
}

/// Clears `single_in_flight` when the task owning a dispatched single
/// command goes away, including by cancellation.
struct InFlight(Arc<Mutex<StreamSession>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.lock().single_in_flight = false;
    }
}

// ─── Controller ─────────────────────────────────────────────────────

struct Inner {
    link: Link,
    stream: ObservationSink<StreamObservation>,
    spawner: Spawner,
    builder: MessageBuilder,
    min_capacity: i32,
    single_period: Duration,
    batch_period: Duration,
    tick: Duration,
    observation_retry: Duration,
    queue: CommandQueue<StreamGate>,
    session: Arc<Mutex<StreamSession>>,
    motion_task: Mutex<Option<TaskHandle>>,
}

pub struct StreamController {
    inner: Arc<Inner>,
    service: ServiceSlot,
}

impl StreamController {
    pub fn new(
        config: &StreamConfig,
        builder: MessageBuilder,
        link: Link,
        stream: ObservationSink<StreamObservation>,
        spawner: Spawner,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                stream,
                spawner,
                builder,
                min_capacity: config.min_capacity,
                single_period: config.single_period(),
                batch_period: config.batch_period(),
                tick: config.tick(),
                observation_retry: config.observation_retry(),
                queue: CommandQueue::new(),
                session: Arc::new(Mutex::new(StreamSession::default())),
                motion_task: Mutex::new(None),
            }),
            service: ServiceSlot::default(),
        }
    }

    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let spawner = self.inner.spawner.clone();
        if self.service.start(|| spawner.spawn_service(run(inner))) {
            info!(min_capacity = self.inner.min_capacity, "stream controller started");
        }
    }

    pub fn stop(&self) {
        if self.service.stop() {
            info!("stream controller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    /// Queue a single command or a batch behind everything already queued.
    pub fn schedule_last(&self, job: impl Into<StreamJob>) -> Result<TaskHandle, ClientError> {
        let pending = self.build(job.into())?;
        Ok(self.inner.queue.push_back(pending))
    }

    /// Queue a single command or a batch ahead of everything already queued.
    pub fn schedule_first(&self, job: impl Into<StreamJob>) -> Result<TaskHandle, ClientError> {
        let pending = self.build(job.into())?;
        Ok(self.inner.queue.push_front(pending))
    }

    /// Cancel every queued, not yet started task.
    pub fn clear_queue(&self) -> usize {
        self.inner.queue.cancel_all()
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Last tag dispatched in this connection epoch.
    pub fn last_tag(&self) -> Option<u64> {
        self.inner.session.lock().last_tag
    }

    pub fn single_in_flight(&self) -> bool {
        self.inner.session.lock().single_in_flight
    }

    fn build(&self, job: StreamJob) -> Result<Pending<StreamGate>, ClientError> {
        let inner = &self.inner;
        let outbound = inner.link.outbound.clone();
        let task = match job {
            StreamJob::Single(Command::StreamControl(kind)) => ReconciliationTask::new(
                Command::StreamControl(kind).name(),
                TaskKind::OneTime,
                Duration::ZERO,
                outbound,
                control_step(inner, kind),
            ),
            StreamJob::Single(command) => {
                ensure_motion(&command)?;
                ReconciliationTask::new(
                    command.name(),
                    command.kind(),
                    inner.single_period,
                    outbound,
                    single_step(inner, command),
                )
            }
            StreamJob::Batch(commands) => {
                for command in &commands {
                    ensure_motion(command)?;
                }
                debug!(points = commands.len(), "batch scheduled");
                ReconciliationTask::new(
                    "stream_batch",
                    TaskKind::PeriodicUntilDone,
                    inner.batch_period,
                    outbound,
                    batch_step(inner, commands),
                )
            }
        };
        let gate = if task.kind() == TaskKind::OneTime {
            StreamGate::Control
        } else {
            StreamGate::Motion
        };
        Ok(Pending::new(task, gate))
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.service.stop();
    }
}

fn ensure_motion(command: &Command) -> Result<(), ClientError> {
    if command.route() == Route::Stream && command.is_motion() {
        Ok(())
    } else {
        Err(ClientError::BadArgument(format!(
            "{} cannot be streamed",
            command.name()
        )))
    }
}

// ─── Steps ──────────────────────────────────────────────────────────

fn control_step(inner: &Inner, kind: StreamCommandType) -> StepFn {
    let builder = inner.builder;
    let session = Arc::clone(&inner.session);
    let queue = inner.queue.downgrade();
    Box::new(move |outbox| {
        if kind == StreamCommandType::Stop {
            session.lock().stop_generation += 1;
            let cleared = CommandQueue::from_weak(&queue).map_or(0, |q| q.cancel_all());
            info!(cleared, "stream stop, pending commands cancelled");
        }
        outbox.push(builder.stream_command(kind));
        Ok(Verdict::Success)
    })
}

/// Dispatch once capacity allows, then wait for the tag to retire.
fn single_step(inner: &Inner, command: Command) -> StepFn {
    let stream = inner.stream.clone();
    let session = Arc::clone(&inner.session);
    let builder = inner.builder;
    let min_capacity = inner.min_capacity;
    let generation = session.lock().stop_generation;
    let mut dispatched: Option<Dispatch> = None;
    let mut in_flight: Option<InFlight> = None;

    Box::new(move |outbox| {
        let mut state = session.lock();

        let Some(sent) = dispatched else {
            if state.stop_generation != generation {
                debug!(command = command.name(), "aborted by stream stop before dispatch");
                return Ok(Verdict::Failure);
            }
            let Some(observed) = stream.latest() else {
                trace!("waiting for a stream observation");
                return Ok(Verdict::Running);
            };
            let available = state.available(&observed);
            if available < min_capacity {
                trace!(available, min_capacity, "waiting for stream capacity");
                return Ok(Verdict::Running);
            }
            let tag = state.next_tag(observed.value.tag);
            outbox.push(builder.activity(&command, tag)?);
            state.record_sent(observed.sequence);
            state.single_in_flight = true;
            in_flight.get_or_insert_with(|| InFlight(Arc::clone(&session)));
            dispatched = Some(Dispatch {
                tag,
                epoch: state.epoch,
                sequence: observed.sequence,
            });
            debug!(command = command.name(), tag, available, "dispatched");
            return Ok(Verdict::Running);
        };

        if state.epoch != sent.epoch {
            warn!(tag = sent.tag, "connection lost before the command retired");
            return Ok(Verdict::Failure);
        }
        let Some(observed) = stream.latest() else {
            return Ok(Verdict::Running);
        };
        let stream_state = observed.value.state;
        if observed.value.tag == sent.tag && stream_state == StreamState::Idle {
            state.single_in_flight = false;
            debug!(tag = sent.tag, "retired");
            return Ok(Verdict::Success);
        }
        if stream_state == StreamState::Stopped && observed.sequence > sent.sequence {
            state.single_in_flight = false;
            warn!(tag = sent.tag, "stream stopped before the command retired");
            return Ok(Verdict::Failure);
        }
        Ok(Verdict::Running)
    })
}

/// Burst-fill trajectory points while capacity allows, then wait for the
/// last one to retire.
fn batch_step(inner: &Inner, commands: Vec<Command>) -> StepFn {
    let stream = inner.stream.clone();
    let session = Arc::clone(&inner.session);
    let builder = inner.builder;
    let min_capacity = inner.min_capacity;
    let generation = session.lock().stop_generation;
    let mut points: VecDeque<Command> = commands.into();
    let mut last_sent: Option<Dispatch> = None;

    Box::new(move |outbox| {
        let mut state = session.lock();

        if last_sent.is_some_and(|sent| sent.epoch != state.epoch) {
            warn!(remaining = points.len(), "connection lost during trajectory");
            return Ok(Verdict::Failure);
        }
        let Some(observed) = stream.latest() else {
            trace!("waiting for a stream observation");
            return Ok(Verdict::Running);
        };

        let stopped_since_dispatch = last_sent.is_some_and(|sent| {
            observed.value.state == StreamState::Stopped && observed.sequence > sent.sequence
        });
        if stopped_since_dispatch {
            warn!(remaining = points.len(), "stream stopped during trajectory");
            return Ok(Verdict::Failure);
        }

        if !points.is_empty() {
            if state.stop_generation != generation {
                info!(dropped = points.len(), "trajectory remainder aborted by stream stop");
                return Ok(Verdict::Failure);
            }
            let mut available = state.available(&observed);
            let mut sent = 0usize;
            while available >= min_capacity {
                let Some(point) = points.pop_front() else {
                    break;
                };
                let tag = state.next_tag(observed.value.tag);
                outbox.push(builder.activity(&point, tag)?);
                state.record_sent(observed.sequence);
                last_sent = Some(Dispatch {
                    tag,
                    epoch: state.epoch,
                    sequence: observed.sequence,
                });
                available -= 1;
                sent += 1;
            }
            if sent > 0 {
                debug!(sent, remaining = points.len(), capacity = observed.value.capacity, "trajectory points dispatched");
            }
            return Ok(Verdict::Running);
        }

        match last_sent {
            None => Ok(Verdict::Success),
            Some(sent) if observed.value.tag == sent.tag && observed.value.state == StreamState::Idle => {
                debug!(tag = sent.tag, "trajectory retired");
                Ok(Verdict::Success)
            }
            Some(_) => Ok(Verdict::Running),
        }
    })
}

// ─── Loop ───────────────────────────────────────────────────────────

async fn run(inner: Arc<Inner>) {
    let mut connection = ConnectionWatch::new(&inner.link);
    loop {
        if connection.poll() {
            info!("connection lost, tag adoption reset");
            inner.session.lock().reset_epoch();
            inner.stream.expire();
        }
        if connection.state() != ConnectionState::Connected {
            trace!("stream controller waiting for connection");
            tokio::time::sleep(inner.observation_retry).await;
            continue;
        }
        if !inner.stream.has_value() {
            warn!("no stream state observed on this connection yet, retrying in {:?}", inner.observation_retry);
            tokio::time::sleep(inner.observation_retry).await;
            continue;
        }
        dispatch_next(&inner);
        tokio::time::sleep(inner.tick).await;
    }
}

/// Start at most one queued task.
fn dispatch_next(inner: &Inner) {
    let mut motion_task = inner.motion_task.lock();
    let motion_busy = motion_task.as_ref().is_some_and(|h| !h.has_exited());
    let admitted = inner.queue.pop_admitted(|gate| match gate {
        StreamGate::Control => true,
        StreamGate::Motion => !motion_busy,
    });
    let Some(pending) = admitted else {
        return;
    };
    if pending.gate == StreamGate::Motion {
        *motion_task = Some(pending.handle.clone());
    }
    drop(motion_task);
    debug!(task = pending.handle.id(), label = pending.handle.label(), "starting stream task");
    inner.spawner.spawn(pending.task);
}
