//! Session event bus
//!
//! Every state transition, traffic sample and health signal is stamped with
//! a monotonically increasing sequence number and delivered in emission
//! order to registered listeners and channel subscribers. Envelopes have a
//! JSON form for hosts that relay them across a process boundary.

use crate::error::ParseError;
use crate::monitor::TrafficSample;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Traffic(TrafficSample),
    NoTraffic,
}

/// A sequenced event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub seq: u64,
    pub event: SessionEvent,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireEnvelope {
    StateChanged { seq: u64, state: SessionState },
    Traffic { seq: u64, upload: u64, download: u64 },
    NoTraffic { seq: u64 },
}

impl Envelope {
    pub fn to_json(&self) -> String {
        let wire = match self.event {
            SessionEvent::StateChanged(state) => WireEnvelope::StateChanged {
                seq: self.seq,
                state,
            },
            SessionEvent::Traffic(sample) => WireEnvelope::Traffic {
                seq: self.seq,
                upload: sample.upload_bytes_per_sec,
                download: sample.download_bytes_per_sec,
            },
            SessionEvent::NoTraffic => WireEnvelope::NoTraffic { seq: self.seq },
        };
        // plain enums and integers always serialize
        serde_json::to_string(&wire).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, ParseError> {
        let wire: WireEnvelope = serde_json::from_str(json)?;
        Ok(match wire {
            WireEnvelope::StateChanged { seq, state } => Self {
                seq,
                event: SessionEvent::StateChanged(state),
            },
            WireEnvelope::Traffic {
                seq,
                upload,
                download,
            } => Self {
                seq,
                event: SessionEvent::Traffic(TrafficSample {
                    upload_bytes_per_sec: upload,
                    download_bytes_per_sec: download,
                }),
            },
            WireEnvelope::NoTraffic { seq } => Self {
                seq,
                event: SessionEvent::NoTraffic,
            },
        })
    }
}

/// Callback-style observer
///
/// Called outside the session and monitor locks, so implementations may
/// read or drive the manager (`state()`, `stop()`). Callbacks run on
/// whichever thread is delivering and arrive in sequence order.
pub trait SessionListener: Send + Sync {
    fn on_state_changed(&self, state: SessionState);

    fn on_traffic_update(&self, _sample: TrafficSample) {}

    fn on_no_traffic(&self) {}
}

#[derive(Default)]
struct BusInner {
    seq: u64,
    listeners: Vec<Arc<dyn SessionListener>>,
    subscribers: Vec<mpsc::UnboundedSender<Envelope>>,
    // stamped envelopes awaiting listener delivery
    pending: VecDeque<Envelope>,
    delivering: bool,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_listener(&self, listener: Arc<dyn SessionListener>) {
        self.lock().listeners.push(listener);
    }

    /// Channel receiving every envelope emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Stamp an event, send it to subscribers and queue it for listeners.
    ///
    /// Safe to call with other locks held: nothing outside the bus runs.
    /// Listeners only see the envelope after a [`EventBus::deliver`].
    pub fn publish(&self, event: SessionEvent) -> Envelope {
        let mut inner = self.lock();
        inner.seq += 1;
        let envelope = Envelope {
            seq: inner.seq,
            event,
        };

        inner.subscribers.retain(|tx| tx.send(envelope).is_ok());
        if !inner.listeners.is_empty() {
            inner.pending.push_back(envelope);
        }

        log::trace!("Emitted #{} {:?}", envelope.seq, envelope.event);
        envelope
    }

    /// Hand queued envelopes to listeners. Must not be called with the
    /// session or monitor locks held.
    ///
    /// Only one caller delivers at a time; a nested or concurrent call
    /// returns at once and its envelopes are picked up by the active one.
    pub fn deliver(&self) {
        {
            let mut inner = self.lock();
            if inner.delivering {
                return;
            }
            inner.delivering = true;
        }
        let _reset = DeliveryReset(self);

        loop {
            let (envelope, listeners) = {
                let mut inner = self.lock();
                match inner.pending.pop_front() {
                    Some(envelope) => (envelope, inner.listeners.clone()),
                    None => {
                        inner.delivering = false;
                        return;
                    }
                }
            };

            for listener in &listeners {
                match envelope.event {
                    SessionEvent::StateChanged(state) => listener.on_state_changed(state),
                    SessionEvent::Traffic(sample) => listener.on_traffic_update(sample),
                    SessionEvent::NoTraffic => listener.on_no_traffic(),
                }
            }
        }
    }

    /// Publish and deliver in one step, for callers holding no other lock
    pub fn emit(&self, event: SessionEvent) -> Envelope {
        let envelope = self.publish(event);
        self.deliver();
        envelope
    }

    pub fn last_seq(&self) -> u64 {
        self.lock().seq
    }
}

/// Releases the delivery slot if a listener panics
struct DeliveryReset<'a>(&'a EventBus);

impl Drop for DeliveryReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

/// Receiver-side view of the session state
///
/// Applies state envelopes in sequence order: anything not newer than the
/// last applied envelope (late or duplicated delivery) is ignored.
#[derive(Debug, Clone)]
pub struct StateTracker {
    state: SessionState,
    last_seq: Option<u64>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            last_seq: None,
        }
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true when the envelope changed the tracked state
    pub fn apply(&mut self, envelope: &Envelope) -> bool {
        let SessionEvent::StateChanged(state) = envelope.event else {
            return false;
        };
        if self.last_seq.is_some_and(|last| envelope.seq <= last) {
            log::debug!("Ignoring stale state envelope #{}", envelope.seq);
            return false;
        }
        self.last_seq = Some(envelope.seq);
        let changed = self.state != state;
        self.state = state;
        changed
    }

    pub fn apply_json(&mut self, json: &str) -> Result<bool, ParseError> {
        let envelope = Envelope::from_json(json)?;
        Ok(self.apply(&envelope))
    }
}
