//! Platform-agnostic types for BLE continuous glucose monitoring sensors.
//!
//! This crate holds the data model shared by the protocol library
//! (cgm-core) and the command line tool (cgm-cli).
//!
//! # Features
//!
//! - Sensor identity, family, model, region and lifecycle state
//! - Raw readings with quality flags and calibrated glucose values
//! - UUID constants for the BLE transports
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use cgm_types::{SensorFamily, SensorIdentity};
//!
//! let identity = SensorIdentity::new(
//!     [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0],
//!     [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25],
//! );
//! assert_eq!(identity.family(), SensorFamily::Libre2);
//! assert_eq!(identity.serial, "3MH001DG75W");
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    CustomCalibrationPoint, FactoryCalibration, PATCH_INFO_LEN, ReadingError, Sensor,
    SensorFamily, SensorGlucose, SensorIdentity, SensorReading, SensorRegion, SensorState,
    SensorType, TrendArrow, UID_LEN, round_to_minute, sample_id, serial_number,
};
pub use uuid as uuids;
