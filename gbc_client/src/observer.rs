//! Observation sinks and the observers that feed them.
//!
//! The inbound path is the only writer: each observer decodes its section of
//! an inbound frame and replaces the sink's snapshot wholesale. Controllers
//! only ever read, and always see a complete snapshot. When a connection ends
//! the controllers expire the sinks they read, so nothing observed on the old
//! connection is acted on after a reconnect.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use gbc_common::error::DecodeError;
use gbc_common::observation::{StatusObservation, StreamObservation, TelemetrySnapshot};

// ─── Sink ───────────────────────────────────────────────────────────

/// A snapshot plus when and in which order it was received.
#[derive(Debug, Clone)]
pub struct Observed<T> {
    pub value: T,
    pub received_at: Instant,
    /// Strictly increasing per sink, starting at 1.
    pub sequence: u64,
}

impl<T> Observed<T> {
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

struct SinkInner<T> {
    latest: RwLock<Option<Arc<Observed<T>>>>,
    sequence: AtomicU64,
    /// Snapshots with a sequence at or below this are stale.
    expired_through: AtomicU64,
}

/// Single-writer, many-reader holder of the latest observation.
pub struct ObservationSink<T> {
    inner: Arc<SinkInner<T>>,
}

impl<T> Clone for ObservationSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ObservationSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObservationSink<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                latest: RwLock::new(None),
                sequence: AtomicU64::new(0),
                expired_through: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the snapshot. Returns the new sequence number.
    pub fn publish(&self, value: T) -> u64 {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let observed = Arc::new(Observed {
            value,
            received_at: Instant::now(),
            sequence,
        });
        *self.inner.latest.write() = Some(observed);
        sequence
    }

    /// Latest snapshot, `None` before the first one and after [`expire`](Self::expire)
    /// until the next publish.
    pub fn latest(&self) -> Option<Arc<Observed<T>>> {
        let latest = self.inner.latest.read().clone()?;
        let expired_through = self.inner.expired_through.load(Ordering::Acquire);
        (latest.sequence > expired_through).then_some(latest)
    }

    pub fn has_value(&self) -> bool {
        self.latest().is_some()
    }

    /// Hide everything published so far.
    pub fn expire(&self) {
        let sequence = self.inner.sequence.load(Ordering::Acquire);
        self.inner.expired_through.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Sequence number of the last publish, stale or not.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// Age of the latest snapshot, `None` before the first one.
    pub fn age(&self) -> Option<Duration> {
        self.latest().map(|o| o.age())
    }
}

// ─── Observers ──────────────────────────────────────────────────────

/// Receives every inbound frame.
pub trait Observer: Send + Sync {
    /// Section name, for logs.
    fn section(&self) -> &'static str;

    /// Decode an already-parsed frame. `Ok(false)` when the frame does not
    /// carry this observer's section.
    fn observe(&self, frame: &Value) -> Result<bool, DecodeError>;

    /// Decode a raw text frame. Malformed input is logged and dropped; the
    /// sink keeps its previous snapshot.
    fn update(&self, message: &str) {
        match serde_json::from_str::<Value>(message) {
            Ok(frame) => self.update_frame(&frame),
            Err(error) => warn!(section = self.section(), %error, "dropping unparsable frame"),
        }
    }

    fn update_frame(&self, frame: &Value) {
        match self.observe(frame) {
            Ok(true) => trace!(section = self.section(), "observation updated"),
            Ok(false) => {}
            Err(error) => warn!(section = self.section(), %error, "dropping malformed section"),
        }
    }
}

macro_rules! section_observer {
    ($(#[$doc:meta])* $name:ident, $value:ty, $section:literal) => {
        $(#[$doc])*
        #[derive(Clone, Default)]
        pub struct $name {
            sink: ObservationSink<$value>,
        }

        impl $name {
            pub fn new(sink: ObservationSink<$value>) -> Self {
                Self { sink }
            }

            pub fn sink(&self) -> &ObservationSink<$value> {
                &self.sink
            }
        }

        impl Observer for $name {
            fn section(&self) -> &'static str {
                $section
            }

            fn observe(&self, frame: &Value) -> Result<bool, DecodeError> {
                match <$value>::from_frame(frame)? {
                    Some(value) => {
                        self.sink.publish(value);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    };
}

section_observer!(
    /// Machine status: power state word, heartbeat, errors, outputs.
    StatusObserver,
    StatusObservation,
    "status"
);
section_observer!(
    /// Activity stream: capacity, run state, retired tag.
    StreamObserver,
    StreamObservation,
    "stream"
);
section_observer!(
    /// Latest joint telemetry frame.
    TelemetryObserver,
    TelemetrySnapshot,
    "telemetry"
);

#[cfg(test)]
mod tests {
    use super::*;
    use gbc_common::cia402::PowerState;
    use gbc_common::observation::StreamState;

    #[test]
    fn publish_replaces_snapshot_and_bumps_sequence() {
        let sink = ObservationSink::new();
        assert!(sink.latest().is_none());
        assert_eq!(sink.publish(1u8), 1);
        assert_eq!(sink.publish(2u8), 2);
        let latest = sink.latest().unwrap();
        assert_eq!(latest.value, 2);
        assert_eq!(latest.sequence, 2);
        assert!(sink.age().is_some());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let sink = ObservationSink::new();
        sink.publish(String::from("first"));
        let held = sink.latest().unwrap();
        sink.publish(String::from("second"));
        assert_eq!(held.value, "first");
        assert_eq!(sink.latest().unwrap().value, "second");
    }

    #[test]
    fn expired_snapshot_is_hidden_until_next_publish() {
        let sink = ObservationSink::new();
        sink.expire();
        sink.publish(7u32);
        sink.expire();
        assert!(sink.latest().is_none());
        assert!(!sink.has_value());
        assert_eq!(sink.sequence(), 1);

        assert_eq!(sink.publish(8u32), 2);
        let latest = sink.latest().unwrap();
        assert_eq!((latest.value, latest.sequence), (8, 2));
    }

    #[test]
    fn status_observer_updates_sink() {
        let observer = StatusObserver::default();
        observer.update(r#"{"status":{"machine":{"statusWord":39,"heartbeat":5}}}"#);
        let status = observer.sink().latest().unwrap();
        assert_eq!(status.value.power_state(), PowerState::OperationEnabled);
        assert_eq!(status.value.heartbeat_echo, 5);
    }

    #[test]
    fn malformed_frames_keep_previous_snapshot() {
        let observer = StreamObserver::default();
        observer.update(r#"{"stream":[{"capacity":20,"queued":0,"state":0,"tag":5}]}"#);
        observer.update(r#"{"stream":[{"capacity":"#);
        observer.update(r#"{"stream":[{"capacity":"full","state":0,"tag":6}]}"#);
        let stream = observer.sink().latest().unwrap();
        assert_eq!(stream.sequence, 1);
        assert_eq!(stream.value.tag, 5);
        assert_eq!(stream.value.state, StreamState::Idle);
    }

    #[test]
    fn frames_without_section_are_ignored() {
        let observer = TelemetryObserver::default();
        observer.update(r#"{"status":{"machine":{"statusWord":64}}}"#);
        assert!(!observer.sink().has_value());
    }
}
