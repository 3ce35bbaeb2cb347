//! Motor event notifications.
//!
//! Drivers and the stage manager push [`MotorEvent`]s into a shared
//! [`EventBus`]. Observers either register a callback or subscribe to the
//! broadcast channel; delivery is best-effort and isolated, so one
//! panicking observer cannot block the rest or destabilize the emitting
//! driver.
//!
//! Payloads are open key/value maps; consumers must ignore unknown keys.

use crate::axis::AxisId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorEventKind {
    MoveStarted,
    MoveCompleted,
    Homed,
    Error,
}

/// A single lifecycle notification. Value type; never mutated after
/// creation.
#[derive(Debug, Clone, Serialize)]
pub struct MotorEvent {
    pub axis: AxisId,
    pub kind: MotorEventKind,
    pub data: serde_json::Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl MotorEvent {
    pub fn new(axis: AxisId, kind: MotorEventKind) -> Self {
        Self {
            axis,
            kind,
            data: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a payload entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Handle for removing a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

type EventCallback = Arc<dyn Fn(&MotorEvent) + Send + Sync>;

/// Fan-out channel for motor events.
///
/// Cloning is cheap; all clones share the same observer set.
#[derive(Clone)]
pub struct EventBus {
    callbacks: Arc<RwLock<Vec<(u64, EventCallback)>>>,
    next_id: Arc<AtomicU64>,
    broadcast: broadcast::Sender<MotorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            callbacks: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            broadcast: tx,
        }
    }

    /// Register an observer callback. Returns a handle for removal.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&MotorEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.push((id, Arc::new(callback)));
        CallbackId(id)
    }

    pub fn remove_callback(&self, id: CallbackId) {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.retain(|(cb_id, _)| *cb_id != id.0);
    }

    /// Subscribe to the broadcast side of the bus. Slow subscribers that
    /// fall behind the channel capacity miss events rather than applying
    /// backpressure to drivers.
    pub fn subscribe(&self) -> broadcast::Receiver<MotorEvent> {
        self.broadcast.subscribe()
    }

    /// Deliver an event to every observer.
    pub fn emit(&self, event: MotorEvent) {
        // Send errors just mean there is no broadcast subscriber right now.
        let _ = self.broadcast.send(event.clone());

        let snapshot: Vec<(u64, EventCallback)> = {
            let callbacks = self
                .callbacks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            callbacks.clone()
        };

        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(
                    callback = id,
                    axis = %event.axis,
                    kind = ?event.kind,
                    "event callback panicked; continuing delivery"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event() -> MotorEvent {
        MotorEvent::new(AxisId::X, MotorEventKind::MoveStarted).with("target_position", 1000.0)
    }

    #[test]
    fn all_callbacks_receive_the_event() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            bus.add_callback(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(event());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.add_callback(|_| panic!("observer bug"));
        {
            let hits = hits.clone();
            bus.add_callback(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit(event());
        bus.emit(event());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_callback_is_not_invoked() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = hits.clone();
            bus.add_callback(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.remove_callback(id);
        bus.emit(event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_subscribers_see_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, MotorEventKind::MoveStarted);
        assert_eq!(received.get("target_position"), Some(&Value::from(1000.0)));
    }

    #[test]
    fn unknown_payload_keys_are_preserved_for_consumers() {
        let e = event().with("vendor_extension", "opaque");
        assert!(e.get("vendor_extension").is_some());
        assert!(e.get("missing").is_none());
    }
}
