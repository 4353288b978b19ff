//! Integration tests for cgm-core
//!
//! Most tests run against recorded fixtures and the mock tag reader. The
//! hardware tests need a powered Bluetooth adapter and a paired sensor:
//! `cargo test --package cgm-core -- --ignored --nocapture`
//!
//! Set `CGM_SENSOR_UID` and `CGM_SENSOR_PATCH_INFO` (hex) to the sensor to
//! stream from.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use cgm_core::calibration::factory_calibrate;
use cgm_core::connection::{
    ConnectionMachine, ConnectionOptions, ConnectionState, Effect, FamilyProfile, MachineEvent,
};
use cgm_core::crypto::{decrypt_memory_image, decrypt_streaming_packet};
use cgm_core::mock::{
    MemoryImageBuilder, MockTagReader, SAMPLE_CALIBRATION, sample_identity, sample_sensor,
};
use cgm_core::pairing::{PairingOptions, pair_sensor};
use cgm_core::parser::{parse_memory, parse_streaming_frame};
use cgm_core::persistence::{ConnectionPersistence, ConnectionRecord, MemoryPersistence};
use cgm_core::pipeline::{GlucosePipeline, GlucoseService, PipelineSettings};
use cgm_core::{
    ConnectionFailureReason, DomainEvent, EventDispatcher, ReadingError, SensorFamily,
    SensorState, SensorType,
};

const MEMORY_FIXTURE: &str = include_str!("fixtures/libre2_memory.hex");
const STREAMING_FIXTURE: &str = include_str!("fixtures/libre2_streaming.hex");

fn fixture(text: &str) -> Vec<u8> {
    hex::decode(text.trim()).unwrap()
}

fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}

// ==================== Recorded fixtures ====================

#[test]
fn test_decode_recorded_memory_image() {
    let identity = sample_identity();
    let memory = decrypt_memory_image(
        identity.sensor_type(),
        &identity.uid,
        &identity.patch_info,
        &fixture(MEMORY_FIXTURE),
    )
    .unwrap();
    let parsed = parse_memory(&identity, t0(), &memory).unwrap();

    assert_eq!(parsed.family, SensorFamily::Libre2);
    assert_eq!(parsed.sensor_type, SensorType::Libre2Eu);
    assert_eq!(parsed.state, SensorState::Ready);
    assert_eq!(parsed.age, 5000);
    assert_eq!(parsed.lifetime, 20160);
    assert_eq!(parsed.calibration, SAMPLE_CALIBRATION);
    assert_eq!(parsed.trend.len(), 7);
    assert_eq!(parsed.history.len(), 32);

    let newest = parsed.trend.last().unwrap();
    assert_eq!(newest.raw_glucose, 1440);
    assert_eq!(newest.timestamp, t0() - time::Duration::seconds(20));
    assert_close(
        factory_calibrate(newest, &parsed.calibration, parsed.family).unwrap(),
        96.95722810555283,
    );

    let oldest = &parsed.trend[0];
    assert_eq!(oldest.raw_glucose, 1450);
    assert_close(
        factory_calibrate(oldest, &parsed.calibration, parsed.family).unwrap(),
        97.64002548657785,
    );

    // Trend slot 2 carries the error bit.
    let flagged: Vec<_> = parsed.trend.iter().filter(|r| !r.is_valid()).collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].raw_glucose, 1420);
    assert!(flagged[0].error.contains(ReadingError::INVALID_DATA));

    let newest_history = parsed.history.last().unwrap();
    assert_eq!(newest_history.raw_glucose, 1045);
    assert_eq!(newest_history.sensor_age, 4995);
    assert_close(
        factory_calibrate(newest_history, &parsed.calibration, parsed.family).unwrap(),
        69.98673155506454,
    );
    // History slot 3 has no thermistor value.
    assert!(
        parsed
            .history
            .iter()
            .any(|r| r.error.contains(ReadingError::THERMISTOR_OUT_OF_RANGE))
    );

    let sensor = parsed.to_sensor(identity, t0());
    assert_eq!(sensor.serial(), "3MH001DG75W");
    assert!(sensor.is_ready());
    assert_eq!(sensor.remaining_minutes(), 20160 - 5000);
}

#[test]
fn test_decode_recorded_streaming_packet() {
    let identity = sample_identity();
    let payload = decrypt_streaming_packet(&identity.uid, &fixture(STREAMING_FIXTURE)).unwrap();
    let frame = parse_streaming_frame(&identity.uid, &SAMPLE_CALIBRATION, t0(), &payload).unwrap();

    assert_eq!(frame.age, 1000);
    assert_eq!(frame.trend.len(), 7);
    assert_eq!(frame.history.len(), 3);
    assert_eq!(frame.trend.last().unwrap().raw_glucose, 1500);
    assert_eq!(frame.trend[0].raw_glucose, 1620);
    assert_eq!(frame.history.last().unwrap().raw_glucose, 1640);
    assert_close(
        factory_calibrate(
            frame.trend.last().unwrap(),
            &SAMPLE_CALIBRATION,
            SensorFamily::Libre2,
        )
        .unwrap(),
        101.05401239170295,
    );
}

#[test]
fn test_tampered_streaming_packet_is_rejected() {
    let mut packet = fixture(STREAMING_FIXTURE);
    packet[10] ^= 0x40;
    let err = decrypt_streaming_packet(&sample_identity().uid, &packet).unwrap_err();
    assert!(matches!(err, cgm_core::Error::Integrity { .. }));
}

// ==================== Connection and pipeline ====================

/// Applies machine effects the way the BLE driver does, minus the radio.
struct SimulatedDriver {
    machine: ConnectionMachine,
    persistence: MemoryPersistence,
    emitted: Vec<DomainEvent>,
    writes: Vec<Vec<u8>>,
}

impl SimulatedDriver {
    fn new(record: ConnectionRecord) -> Self {
        Self {
            machine: ConnectionMachine::new(ConnectionOptions::default(), record.clone()),
            persistence: MemoryPersistence::with_record(record),
            emitted: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn handle(&mut self, event: MachineEvent, now: OffsetDateTime) -> Vec<Effect> {
        let effects = self.machine.handle(event, now);
        for effect in &effects {
            match effect {
                Effect::PersistPeripheral(id) => {
                    self.persistence.set_peripheral_id(id.clone()).unwrap()
                }
                Effect::PersistUnlockCount(count) => {
                    self.persistence.set_unlock_count(*count).unwrap()
                }
                Effect::Write(bytes) => self.writes.push(bytes.clone()),
                Effect::Emit(event) => self.emitted.push(event.clone()),
                _ => {}
            }
        }
        effects
    }

    fn connect(&mut self, interval: u32) {
        for event in [
            MachineEvent::AdapterPowered(true),
            MachineEvent::ConnectRequested {
                sensor: Box::new(sample_sensor(t0())),
                sampling_interval_minutes: interval,
            },
            MachineEvent::PeripheralRetrieved(Some("p1".into())),
            MachineEvent::PeripheralConnected,
            MachineEvent::ServicesDiscovered { found: true },
            MachineEvent::CharacteristicsDiscovered {
                write: true,
                notify: true,
            },
            MachineEvent::NotificationsEnabled,
        ] {
            self.handle(event, t0());
        }
    }

    fn notify_packet(&mut self, packet: &[u8], now: OffsetDateTime) {
        let mut offset = 0;
        for size in FamilyProfile::libre2_direct().chunk_sizes {
            self.handle(
                MachineEvent::Notification(packet[offset..offset + size].to_vec()),
                now,
            );
            offset += size;
        }
    }

    fn readings_batches(&self) -> Vec<Vec<cgm_core::SensorReading>> {
        self.emitted
            .iter()
            .filter_map(|e| match e {
                DomainEvent::GlucoseReadingsAdded { readings } => Some(readings.clone()),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_recorded_packet_flows_to_glucose_values() {
    let mut driver = SimulatedDriver::new(ConnectionRecord {
        peripheral_id: Some("p1".into()),
        unlock_count: 0,
    });
    driver.connect(1);
    assert_eq!(driver.machine.state(), ConnectionState::Streaming);
    assert_eq!(driver.persistence.unlock_count(), 1);
    assert_eq!(driver.writes.len(), 1);

    driver.notify_packet(&fixture(STREAMING_FIXTURE), t0());
    let batches = driver.readings_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 10);

    let settings = PipelineSettings::default().smoothing(false);
    let mut pipeline = GlucosePipeline::for_sensor(&sample_sensor(t0()), settings).unwrap();
    let outcome = pipeline.ingest(&batches[0]);
    let values = outcome.values();
    assert_eq!(values.len(), 10);

    let newest = values.last().unwrap();
    assert_eq!(newest.timestamp, t0() - time::Duration::seconds(20));
    assert_eq!(newest.value, 101);
    assert_close(newest.raw_value, 101.05401239170295);
    assert!(values.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn test_unreachable_sensor_forgets_peripheral() {
    let mut driver = SimulatedDriver::new(ConnectionRecord {
        peripheral_id: Some("p1".into()),
        unlock_count: 7,
    });
    driver.connect(1);
    assert_eq!(driver.persistence.unlock_count(), 8);

    driver.handle(MachineEvent::PeripheralDisconnected(Some("link lost".into())), t0());
    let attempts = ConnectionOptions::default().reconnect.max_attempts.unwrap_or(5);
    for _ in 0..attempts {
        driver.handle(
            MachineEvent::ConnectFailed(ConnectionFailureReason::OutOfRange),
            t0(),
        );
        if driver.machine.state() == ConnectionState::Scanning {
            break;
        }
        driver.handle(MachineEvent::ReconnectElapsed, t0());
    }

    assert_eq!(driver.machine.state(), ConnectionState::Scanning);
    assert_eq!(driver.persistence.peripheral_id(), None);
    assert_eq!(driver.persistence.unlock_count(), 8);
    assert!(driver.emitted.iter().any(|e| matches!(
        e,
        DomainEvent::ConnectionErrorRaised { error } if error.critical
    )));
}

// ==================== Pairing ====================

#[tokio::test(start_paused = true)]
async fn test_pairing_feeds_glucose_service() {
    let events = EventDispatcher::default();
    let mut rx = events.subscribe();
    let pipeline = GlucosePipeline::new(PipelineSettings::default().sampling_interval(5)).unwrap();
    let service = GlucoseService::spawn(pipeline, events.clone());

    let image = MemoryImageBuilder::new(sample_identity())
        .age(5000)
        .glucose(1500)
        .build()
        .unwrap();
    let reader = MockTagReader::new(sample_identity(), image);
    let persistence = MemoryPersistence::with_record(ConnectionRecord {
        peripheral_id: Some("previous".into()),
        unlock_count: 3,
    });

    let result = pair_sensor(
        &reader,
        &PairingOptions::default(),
        &CancellationToken::new(),
        &persistence,
        &events,
    )
    .await
    .unwrap();
    assert_eq!(persistence.record(), ConnectionRecord::default());

    let values = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(DomainEvent::GlucoseValuesAdded { values }) = rx.recv().await {
                return values;
            }
        }
    })
    .await
    .unwrap();

    assert!(!values.is_empty());
    assert!(values.len() < result.readings().len());
    assert!(
        values
            .windows(2)
            .all(|w| (w[1].timestamp - w[0].timestamp).whole_seconds() >= 5 * 60 - 15)
    );

    let pipeline = service.shutdown().await.unwrap();
    assert_eq!(
        pipeline.sensor().map(|s| s.serial()),
        Some(result.sensor.serial())
    );
}

// ==================== Hardware ====================

fn sensor_from_env() -> Option<cgm_core::SensorIdentity> {
    let uid = hex::decode(env::var("CGM_SENSOR_UID").ok()?).ok()?;
    let patch = hex::decode(env::var("CGM_SENSOR_PATCH_INFO").ok()?).ok()?;
    Some(cgm_core::SensorIdentity::new(
        uid.try_into().ok()?,
        patch.try_into().ok()?,
    ))
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_stream_from_sensor() {
    use cgm_core::connection::{BleDriver, DriverConfig, get_adapter};

    let Some(identity) = sensor_from_env() else {
        println!("CGM_SENSOR_UID / CGM_SENSOR_PATCH_INFO not set, skipping");
        return;
    };
    let mut sensor = cgm_core::Sensor::new(identity, SAMPLE_CALIBRATION, OffsetDateTime::now_utc());
    sensor.state = SensorState::Ready;

    let events = EventDispatcher::default();
    let mut rx = events.subscribe();
    let adapter = get_adapter().await.unwrap();
    let (handle, task) = BleDriver::spawn(
        adapter,
        Arc::new(MemoryPersistence::new()),
        events.clone(),
        ConnectionOptions::default(),
        DriverConfig::default(),
    )
    .unwrap();
    handle.connect(sensor, 1).await.unwrap();

    let streamed = timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(DomainEvent::GlucoseReadingsAdded { readings }) => return readings,
                Ok(event) => println!("{:?}", event),
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await;

    handle.shutdown();
    let _ = task.await;
    match streamed {
        Ok(readings) => println!("Received {} readings", readings.len()),
        Err(_) => panic!("No readings within 120 seconds"),
    }
}
