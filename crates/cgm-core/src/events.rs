//! Domain events published by the connection, pairing and glucose pipeline.
//!
//! Everything observable about the system flows through one
//! [`EventDispatcher`]. Producers never block on slow consumers: a lagging
//! receiver loses the oldest events and is told how many it missed.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use cgm_types::{Sensor, SensorGlucose, SensorReading, SensorState};

use crate::connection::ConnectionState;

/// User-visible connection problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionError {
    /// Human-readable description.
    pub message: String,
    /// When the problem was detected.
    pub timestamp: OffsetDateTime,
    /// Whether the problem needs user attention (e.g. sensor unreachable).
    pub critical: bool,
}

impl ConnectionError {
    /// A problem the system recovers from on its own.
    pub fn transient(message: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            message: message.into(),
            timestamp,
            critical: false,
        }
    }

    /// A problem that needs user attention.
    pub fn critical(message: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            message: message.into(),
            timestamp,
            critical: true,
        }
    }
}

/// Events that can be emitted by the acquisition stack.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DomainEvent {
    /// The connection state machine moved to a new state.
    ConnectionStateChanged { state: ConnectionState },
    /// A sensor was paired and replaces any previous one.
    SensorPaired { sensor: Box<Sensor> },
    /// Age or lifecycle state of the paired sensor, sent with every frame.
    SensorStateChanged { age: u16, state: SensorState },
    /// Raw readings received from the sensor, oldest first.
    GlucoseReadingsAdded { readings: Vec<SensorReading> },
    /// Calibrated glucose values ready for display, oldest first.
    GlucoseValuesAdded { values: Vec<SensorGlucose> },
    /// A connection or processing problem.
    ConnectionErrorRaised { error: ConnectionError },
}

/// Sender for domain events.
pub type EventSender = broadcast::Sender<DomainEvent>;

/// Receiver for domain events.
pub type EventReceiver = broadcast::Receiver<DomainEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Create a default event channel with capacity 100.
pub fn default_event_channel() -> (EventSender, EventReceiver) {
    event_channel(100)
}

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DomainEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
