//! Transport seam.
//!
//! Controllers see the connection through a [`Link`]: a bounded outbound
//! queue plus a `watch` of the connection state. The inbound side fans each
//! text frame out to the registered [`Observer`]s. [`ws::WsTransport`] is the
//! websocket implementation; [`loopback`] wires the same channels for tests
//! and offline use.

pub mod ws;

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use gbc_common::error::StepError;

use crate::observer::Observer;

pub use self::ws::WsTransport;

/// Lifecycle of the controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

// ─── Outbound ───────────────────────────────────────────────────────

/// Producer side of the bounded outbound queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a payload, waiting while the queue is full.
    pub async fn send(&self, payload: String) -> Result<(), StepError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| StepError::OutboundClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─── Link ───────────────────────────────────────────────────────────

/// What a controller needs from the transport.
#[derive(Debug, Clone)]
pub struct Link {
    pub outbound: Outbound,
    pub connection: watch::Receiver<ConnectionState>,
}

impl Link {
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// A controller loop's view of connection changes.
///
/// Remembers the last state it saw, so a drop and reconnect that both happen
/// between two polls still count as a lost connection.
#[derive(Debug)]
pub struct ConnectionWatch {
    rx: watch::Receiver<ConnectionState>,
    last: ConnectionState,
}

impl ConnectionWatch {
    pub fn new(link: &Link) -> Self {
        let mut rx = link.connection.clone();
        let last = *rx.borrow_and_update();
        Self { rx, last }
    }

    /// State as of the last [`poll`](Self::poll).
    pub fn state(&self) -> ConnectionState {
        self.last
    }

    /// Consume pending changes. True if a connection ended since the last call.
    pub fn poll(&mut self) -> bool {
        if !self.rx.has_changed().unwrap_or(false) {
            return false;
        }
        let now = *self.rx.borrow_and_update();
        let ended = self.last == ConnectionState::Connected || now == ConnectionState::Disconnected;
        self.last = now;
        ended
    }
}

/// Far end of a loopback link: what controllers sent, and a switch for the
/// connection state.
pub struct LoopbackEnd {
    pub sent: mpsc::Receiver<String>,
    pub connection: watch::Sender<ConnectionState>,
}

/// A link with no network behind it, reported as connected.
pub fn loopback(capacity: usize) -> (Link, LoopbackEnd) {
    let (outbound, sent) = Outbound::channel(capacity);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    (
        Link {
            outbound,
            connection: state_rx,
        },
        LoopbackEnd {
            sent,
            connection: state_tx,
        },
    )
}

// ─── Inbound Fan-out ────────────────────────────────────────────────

/// Observers registered for inbound frames.
#[derive(Clone, Default)]
pub struct Subscribers {
    observers: Arc<RwLock<Vec<Arc<dyn Observer>>>>,
}

impl Subscribers {
    pub fn attach(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Parse `message` once and hand it to every observer.
    pub fn dispatch(&self, message: &str) {
        let frame: Value = match serde_json::from_str(message) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping unparsable inbound frame");
                return;
            }
        };
        for observer in self.observers.read().iter() {
            observer.update_frame(&frame);
        }
    }
}
