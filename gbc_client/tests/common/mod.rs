//! Simulated GBC controller for integration tests.
//!
//! Consumes what the client puts on a loopback link, applies it the way a
//! controller would (CiA 402 transitions on control words, stream slots on
//! activities) and publishes the resulting status and stream frames back
//! through the client's subscribers.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use gbc_client::transport::{ConnectionState, LoopbackEnd, Subscribers};
use gbc_common::cia402::PowerState;
use gbc_common::observation::StreamState;

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub power: PowerState,
    pub heartbeat_counter: u64,
    pub control_words: Vec<u16>,
    /// (receipt time, echoed counter)
    pub heartbeats: Vec<(Instant, u64)>,
    pub capacity: i32,
    pub queued: i32,
    pub retired_tag: u64,
    pub stream_state: StreamState,
    pub dispatched_tags: Vec<u64>,
    pub stream_commands: Vec<u64>,
    pub other_commands: Vec<Value>,
    /// Retire every activity as soon as it arrives.
    pub auto_retire: bool,
}

impl DeviceState {
    pub fn new(power: PowerState) -> Self {
        Self {
            power,
            heartbeat_counter: 1,
            control_words: Vec::new(),
            heartbeats: Vec::new(),
            capacity: 20,
            queued: 0,
            retired_tag: 0,
            stream_state: StreamState::Idle,
            dispatched_tags: Vec::new(),
            stream_commands: Vec::new(),
            other_commands: Vec::new(),
            auto_retire: false,
        }
    }

    fn status_word(&self) -> u16 {
        match self.power {
            PowerState::NotReadyToSwitchOn => 0x0000,
            PowerState::SwitchOnDisabled => 0x0040,
            PowerState::ReadyToSwitchOn => 0x0021,
            PowerState::SwitchedOn => 0x0023,
            PowerState::OperationEnabled => 0x0027,
            PowerState::QuickStop => 0x0007,
            PowerState::FaultReactionActive => 0x000F,
            PowerState::Fault => 0x0008,
            PowerState::Unknown => 0x0001,
        }
    }

    /// One CiA 402 transition per control word.
    fn apply_control_word(&mut self, cw: u16) {
        let previous = self.control_words.last().copied().unwrap_or(0);
        let rising_reset = cw & 0x80 != 0 && previous & 0x80 == 0;
        self.control_words.push(cw);
        self.power = match self.power {
            PowerState::Fault if rising_reset => PowerState::SwitchOnDisabled,
            PowerState::Fault => PowerState::Fault,
            _ if cw == 0 => PowerState::SwitchOnDisabled,
            PowerState::SwitchOnDisabled if cw & 0x87 == 0x06 => PowerState::ReadyToSwitchOn,
            PowerState::ReadyToSwitchOn if cw & 0x8F == 0x07 => PowerState::SwitchedOn,
            PowerState::SwitchedOn if cw & 0x8F == 0x0F => PowerState::OperationEnabled,
            state => state,
        };
    }

    fn apply(&mut self, payload: &Value) {
        if let Some(items) = payload["stream"]["items"].as_array() {
            for item in items {
                if let Some(tag) = item["tag"].as_u64() {
                    self.dispatched_tags.push(tag);
                    if self.auto_retire {
                        self.retired_tag = tag;
                        self.stream_state = StreamState::Idle;
                    } else {
                        self.capacity -= 1;
                        self.queued += 1;
                        self.stream_state = StreamState::Active;
                    }
                }
            }
            return;
        }
        let command = &payload["command"];
        let machine = &command["machine"]["0"]["command"];
        if let Some(cw) = machine["controlWord"].as_u64() {
            self.apply_control_word(cw as u16);
        } else if let Some(echo) = machine["heartbeat"].as_u64() {
            self.heartbeats.push((Instant::now(), echo));
        } else if let Some(kind) = command["stream"]["0"]["command"]["streamCommand"].as_u64() {
            self.stream_commands.push(kind);
            match kind {
                0 => self.stream_state = StreamState::Active,
                1 => self.stream_state = StreamState::Paused,
                _ => self.stream_state = StreamState::Stopped,
            }
        } else {
            self.other_commands.push(payload.clone());
        }
    }

    pub fn frame(&self) -> String {
        json!({
            "status": {
                "machine": {
                    "statusWord": self.status_word(),
                    "heartbeat": self.heartbeat_counter,
                    "target": 2,
                },
            },
            "stream": [{
                "capacity": self.capacity,
                "queued": self.queued,
                "state": self.stream_state as u8,
                "tag": self.retired_tag,
            }],
        })
        .to_string()
    }
}

/// Handle to the simulated controller task.
pub struct Device {
    pub state: Arc<Mutex<DeviceState>>,
    pub connection: watch::Sender<ConnectionState>,
    subscribers: Subscribers,
    join: JoinHandle<()>,
}

impl Device {
    /// Publish the initial frame and start consuming `end.sent` on the
    /// current runtime.
    pub fn spawn(end: LoopbackEnd, subscribers: Subscribers, initial: DeviceState) -> Self {
        let LoopbackEnd {
            mut sent,
            connection,
        } = end;
        let state = Arc::new(Mutex::new(initial));
        subscribers.dispatch(&state.lock().frame());

        let task_state = Arc::clone(&state);
        let task_subscribers = subscribers.clone();
        let join = tokio::spawn(async move {
            while let Some(payload) = sent.recv().await {
                let Ok(payload) = serde_json::from_str::<Value>(&payload) else {
                    continue;
                };
                let frame = {
                    let mut state = task_state.lock();
                    state.apply(&payload);
                    state.frame()
                };
                task_subscribers.dispatch(&frame);
            }
        });

        Self {
            state,
            connection,
            subscribers,
            join,
        }
    }

    /// Mutate the device state and publish the result.
    pub fn update(&self, change: impl FnOnce(&mut DeviceState)) {
        let frame = {
            let mut state = self.state.lock();
            change(&mut state);
            state.frame()
        };
        self.subscribers.dispatch(&frame);
    }

    /// Retire everything dispatched so far and go idle.
    pub fn retire_all(&self) {
        self.update(|state| {
            if let Some(&last) = state.dispatched_tags.last() {
                state.retired_tag = last;
            }
            state.capacity += state.queued;
            state.queued = 0;
            state.stream_state = StreamState::Idle;
        });
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().clone()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.join.abort();
    }
}
