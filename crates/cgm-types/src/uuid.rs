//! Bluetooth UUIDs and advertisement constants for CGM sensors.
//!
//! Two BLE transports are covered: sensors that stream directly over their
//! own GATT service, and clip-on NFC-to-BLE transmitters that relay the
//! sensor memory over a UART-style service.

use uuid::{Uuid, uuid};

// --- Direct sensor streaming ---

/// GATT service exposed by sensors that stream directly.
pub const SENSOR_SERVICE: Uuid = uuid!("0000fde3-0000-1000-8000-00805f9b34fb");

/// Characteristic used to write the unlock payload.
pub const SENSOR_WRITE: Uuid = uuid!("0000f001-0000-1000-8000-00805f9b34fb");

/// Characteristic that notifies encrypted measurement chunks.
pub const SENSOR_NOTIFY: Uuid = uuid!("0000f002-0000-1000-8000-00805f9b34fb");

/// Advertised name prefix of directly streaming sensors.
pub const SENSOR_NAME_PREFIX: &str = "ABBOTT";

/// Trailing bytes every sensor uid ends with. The advertisement only carries
/// the six leading uid bytes.
pub const UID_SUFFIX: [u8; 2] = [0x07, 0xE0];

// --- Transmitter bridge ---

/// UART-style service of NFC-to-BLE transmitter bridges.
pub const TRANSMITTER_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Transmitter command characteristic.
pub const TRANSMITTER_WRITE: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// Transmitter data characteristic.
pub const TRANSMITTER_NOTIFY: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Advertised name prefix of transmitter bridges.
pub const TRANSMITTER_NAME_PREFIX: &str = "Bubble";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_characteristics_share_base_uuid() {
        let base = &SENSOR_SERVICE.as_bytes()[4..];
        assert_eq!(&SENSOR_WRITE.as_bytes()[4..], base);
        assert_eq!(&SENSOR_NOTIFY.as_bytes()[4..], base);
        assert_ne!(SENSOR_WRITE, SENSOR_NOTIFY);
    }

    #[test]
    fn test_transmitter_uuids_are_distinct() {
        assert_ne!(TRANSMITTER_SERVICE, TRANSMITTER_WRITE);
        assert_ne!(TRANSMITTER_WRITE, TRANSMITTER_NOTIFY);
        assert_eq!(
            TRANSMITTER_NOTIFY.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }
}
