//! Core BLE, protocol and calibration library for continuous glucose
//! monitoring sensors.
//!
//! This crate talks to FreeStyle Libre style sensors: it pairs a sensor
//! through its NFC tag, keeps a Bluetooth Low Energy link to it, decrypts
//! and decodes the streamed packets and turns raw readings into calibrated,
//! smoothed glucose values.
//!
//! # Features
//!
//! - **Pairing**: read and decrypt the sensor memory image over NFC
//! - **Protocol**: CRC-16, bit-packed records and the sensor ciphers
//! - **Connection**: scan, connect, unlock and stream with automatic reconnection
//! - **Calibration**: factory and custom calibration, trend and slope
//! - **Pipeline**: outlier rejection, interval sampling and smoothing
//! - **Events**: one broadcast bus for state, sensor and glucose updates
//!
//! # Architecture
//!
//! The connection logic lives in a pure state machine
//! ([`ConnectionMachine`]) that turns events into effects. The
//! [`BleDriver`] performs those effects against a `btleplug` adapter and
//! feeds back what happens. Glucose processing is owned by a single task
//! ([`GlucoseService`]) subscribed to the [`EventDispatcher`].
//!
//! # Supported Sensors
//!
//! | Sensor | Pairing | Streaming |
//! |--------|---------|-----------|
//! | Libre 1 | yes | no |
//! | Libre 2 (EU) | yes | yes |
//! | Libre US 14 day | yes | no |
//! | Libre Pro | no | no |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cgm_core::connection::{BleDriver, ConnectionOptions, DriverConfig, get_adapter};
//! use cgm_core::persistence::MemoryPersistence;
//! use cgm_core::pipeline::{GlucosePipeline, GlucoseService, PipelineSettings};
//! use cgm_core::{DomainEvent, EventDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     # let sensor = cgm_core::mock::sample_sensor(time::OffsetDateTime::now_utc());
//!     let events = EventDispatcher::default();
//!     let mut rx = events.subscribe();
//!
//!     let pipeline = GlucosePipeline::for_sensor(&sensor, PipelineSettings::default())?;
//!     let _service = GlucoseService::spawn(pipeline, events.clone());
//!
//!     let adapter = get_adapter().await?;
//!     let (handle, _task) = BleDriver::spawn(
//!         adapter,
//!         Arc::new(MemoryPersistence::new()),
//!         events.clone(),
//!         ConnectionOptions::default(),
//!         DriverConfig::default(),
//!     )?;
//!     handle.connect(sensor, 5).await?;
//!
//!     while let Ok(event) = rx.recv().await {
//!         if let DomainEvent::GlucoseValuesAdded { values } = event {
//!             for value in values {
//!                 println!("{} mg/dL {}", value.value, value.trend);
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod mock;
pub mod pairing;
pub mod parser;
pub mod persistence;
pub mod pipeline;
pub mod reconnect;
pub mod retry;

// Re-export types and uuid modules from cgm-types
pub use cgm_types::types;
pub use cgm_types::uuid;

// Core exports
pub use connection::{
    BleDriver, ConnectionMachine, ConnectionOptions, ConnectionState, DriverConfig, DriverHandle,
};
pub use error::{ConnectionFailureReason, Error, ErrorKind, Result};
pub use events::{ConnectionError, DomainEvent, EventDispatcher, EventReceiver, EventSender};
pub use pairing::{PairingOptions, PairingResult, TagReader, pair, pair_sensor};
pub use parser::{ParsedMemory, RawRecord, parse_memory, parse_streaming_frame};
pub use persistence::{ConnectionPersistence, ConnectionRecord, FilePersistence, MemoryPersistence};
pub use pipeline::{GlucosePipeline, GlucoseService, IngestOutcome, PipelineSettings};
pub use reconnect::ReconnectOptions;
pub use retry::{RetryConfig, with_retry, with_retry_cancellable};

// Re-export from cgm-types
pub use cgm_types::uuid as uuids;
pub use cgm_types::{
    FactoryCalibration, ReadingError, Sensor, SensorFamily, SensorGlucose, SensorIdentity,
    SensorReading, SensorState, SensorType, TrendArrow,
};
