//! Per-family BLE capabilities.
//!
//! Sensors that stream directly and sensors read through a bridge
//! transmitter differ only in data: UUIDs, notification chunking, cipher and
//! how the peripheral is recognized. [`FamilyProfile`] holds those values so
//! the state machine has a single code path.

use std::collections::HashMap;

use uuid::Uuid;

use cgm_types::uuids::{
    SENSOR_NAME_PREFIX, SENSOR_NOTIFY, SENSOR_SERVICE, SENSOR_WRITE, TRANSMITTER_NAME_PREFIX,
    TRANSMITTER_NOTIFY, TRANSMITTER_SERVICE, TRANSMITTER_WRITE, UID_SUFFIX,
};
use cgm_types::{Sensor, SensorFamily};

/// How a complete frame is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoGeneration {
    /// 46-byte streaming packet with its own keystream.
    Streaming,
    /// 344-byte memory image with the block cipher of the sensor type.
    Memory,
}

/// What a scan result looked like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral identifier.
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Manufacturer data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

const LIBRE2_CHUNKS: [usize; 3] = [20, 18, 8];

const TRANSMITTER_CHUNK_COUNT: usize = 22;
const TRANSMITTER_CHUNKS: [usize; TRANSMITTER_CHUNK_COUNT] = {
    let mut sizes = [20; TRANSMITTER_CHUNK_COUNT];
    sizes[TRANSMITTER_CHUNK_COUNT - 1] = 12;
    sizes
};

/// First byte of every transmitter data chunk.
pub const TRANSMITTER_DATA_MARKER: u8 = 0x82;

/// Command asking a transmitter to start sending memory images.
pub const TRANSMITTER_START_COMMAND: [u8; 3] = [0x00, 0x00, 0x05];

/// BLE capabilities of one sensor family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyProfile {
    /// Short name for logs.
    pub name: &'static str,
    /// GATT service carrying the data characteristics.
    pub service: Uuid,
    /// Characteristic commands are written to.
    pub write: Uuid,
    /// Characteristic data is notified on.
    pub notify: Uuid,
    /// Expected length of every notification of a frame, in order.
    pub chunk_sizes: &'static [usize],
    /// Bytes stripped from the front of every chunk.
    pub chunk_header_len: usize,
    /// Required first byte of every chunk, if any.
    pub chunk_marker: Option<u8>,
    /// How complete frames are decrypted.
    pub crypto: CryptoGeneration,
    /// Advertised name prefix, compared case-insensitively.
    pub name_prefix: &'static str,
    /// Whether manufacturer data must carry the sensor uid.
    pub match_manufacturer_uid: bool,
    /// Whether the unlock payload is written after connecting.
    pub requires_unlock: bool,
    /// Command written after connecting, if any.
    pub start_command: Option<&'static [u8]>,
}

impl FamilyProfile {
    /// Sensor streaming over BLE on its own.
    pub fn libre2_direct() -> Self {
        Self {
            name: "libre2-direct",
            service: SENSOR_SERVICE,
            write: SENSOR_WRITE,
            notify: SENSOR_NOTIFY,
            chunk_sizes: &LIBRE2_CHUNKS,
            chunk_header_len: 0,
            chunk_marker: None,
            crypto: CryptoGeneration::Streaming,
            name_prefix: SENSOR_NAME_PREFIX,
            match_manufacturer_uid: true,
            requires_unlock: true,
            start_command: None,
        }
    }

    /// Bridge transmitter relaying the sensor's memory image.
    pub fn transmitter() -> Self {
        Self {
            name: "transmitter",
            service: TRANSMITTER_SERVICE,
            write: TRANSMITTER_WRITE,
            notify: TRANSMITTER_NOTIFY,
            chunk_sizes: &TRANSMITTER_CHUNKS,
            chunk_header_len: 4,
            chunk_marker: Some(TRANSMITTER_DATA_MARKER),
            crypto: CryptoGeneration::Memory,
            name_prefix: TRANSMITTER_NAME_PREFIX,
            match_manufacturer_uid: false,
            requires_unlock: false,
            start_command: Some(&TRANSMITTER_START_COMMAND),
        }
    }

    /// Profile used to talk to `sensor`.
    pub fn for_sensor(sensor: &Sensor) -> Self {
        match sensor.family {
            SensorFamily::Libre2 | SensorFamily::LibreSense => Self::libre2_direct(),
            _ => Self::transmitter(),
        }
    }

    /// Total payload bytes of a frame, after headers are stripped.
    pub fn frame_len(&self) -> usize {
        self.chunk_sizes
            .iter()
            .map(|size| size.saturating_sub(self.chunk_header_len))
            .sum()
    }

    /// Whether a scan result is the peripheral for `sensor`.
    pub fn matches(&self, advertisement: &Advertisement, sensor: &Sensor) -> bool {
        let Some(name) = advertisement.name.as_deref() else {
            return false;
        };
        let prefix_len = self.name_prefix.len();
        let name_matches = name.len() >= prefix_len
            && name.is_char_boundary(prefix_len)
            && name[..prefix_len].eq_ignore_ascii_case(self.name_prefix);
        if !name_matches {
            return false;
        }

        if !self.match_manufacturer_uid {
            return true;
        }

        let uid = &sensor.identity.uid;
        uid[6..] == UID_SUFFIX
            && advertisement
                .manufacturer_data
                .values()
                .any(|data| data.len() >= 6 && data[..6] == uid[..6])
    }
}
