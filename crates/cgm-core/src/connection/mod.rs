//! Sensor connection over BLE.
//!
//! The connection is split in two halves:
//!
//! - [`machine`]: a pure state machine. It turns events (adapter power,
//!   scan results, link changes, notifications, timer expiries) into
//!   [`Effect`]s and never performs I/O.
//! - [`driver`]: an async task that owns the btleplug adapter and
//!   peripheral, executes effects and feeds their outcome back into the
//!   machine.
//!
//! Frames are reassembled by [`frame`] according to the [`FamilyProfile`]
//! of the sensor.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod driver;
pub mod frame;
pub mod machine;
pub mod profile;
pub mod scan;

pub use driver::{BleDriver, DriverConfig, DriverHandle};
pub use frame::{Assembly, FrameAssembler};
pub use machine::{ConnectionMachine, ConnectionOptions, Effect, MachineEvent};
pub use profile::{Advertisement, CryptoGeneration, FamilyProfile};
pub use scan::{format_peripheral_id, get_adapter};

/// Observable state of the sensor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Adapter state not reported yet.
    #[default]
    Unknown,
    /// Bluetooth is off.
    PoweredOff,
    /// Bluetooth is on, nothing requested.
    PoweredOn,
    /// Looking for the sensor's peripheral.
    Scanning,
    /// Connection attempt in flight.
    Connecting,
    /// Link up, setting up characteristics.
    Connected,
    /// Notifications flowing.
    Streaming,
    /// Link down.
    Disconnected,
    /// Reading a new sensor over NFC.
    Pairing,
}

impl ConnectionState {
    /// Whether a BLE link is up.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::PoweredOff => "powered off",
            ConnectionState::PoweredOn => "powered on",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Pairing => "pairing",
        };
        write!(f, "{}", name)
    }
}
