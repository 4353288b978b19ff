//! Test doubles and fixture builders.
//!
//! This module provides a mock tag reader and builders for memory images
//! and streaming packets, so pairing, parsing and the connection machine can
//! be exercised without a sensor.
//!
//! # Features
//!
//! - **Sample sensor**: a Libre 2 EU identity with realistic calibration
//! - **Memory images**: plain or encrypted, with valid section CRCs
//! - **Streaming packets**: sealed and encrypted 46-byte frames
//! - **Failure injection**: failing and slow tag reads

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use cgm_types::{
    FactoryCalibration, PATCH_INFO_LEN, Sensor, SensorIdentity, SensorState, UID_LEN,
};

use crate::codec::{seal_leading_crc, seal_trailing_crc};
use crate::connection::FamilyProfile;
use crate::crypto::{
    BLOCK_LEN, MEMORY_IMAGE_LEN, STREAMING_PAYLOAD_LEN, apply_memory_cipher,
    encrypt_streaming_packet,
};
use crate::error::{Error, Result};
use crate::pairing::TagReader;
use crate::parser::{
    AGE_OFFSET, HISTORY_INDEX_OFFSET, HISTORY_OFFSET, HISTORY_SLOTS, LIFETIME_OFFSET, RECORD_LEN,
    RawRecord, SECTIONS, STATE_OFFSET, STREAMING_AGE_OFFSET, STREAMING_HISTORY_COUNT,
    STREAMING_RECORD_LEN, STREAMING_TREND_COUNT, TREND_INDEX_OFFSET, TREND_OFFSET, TREND_SLOTS,
    write_factory_calibration,
};

/// Uid of the sample sensor.
pub const SAMPLE_UID: [u8; UID_LEN] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];

/// Patch info of the sample sensor (Libre 2, Europe).
pub const SAMPLE_PATCH_INFO: [u8; PATCH_INFO_LEN] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

/// Factory calibration of the sample sensor.
pub const SAMPLE_CALIBRATION: FactoryCalibration = FactoryCalibration {
    i1: 1,
    i2: 300,
    i3: 20,
    i4: 1020,
    i5: 10000,
    i6: 16000,
};

/// Thermistor value giving about 31 °C with [`SAMPLE_CALIBRATION`].
pub const SAMPLE_RAW_TEMPERATURE: u16 = 2428;

/// Identity of the sample sensor.
pub fn sample_identity() -> SensorIdentity {
    SensorIdentity::new(SAMPLE_UID, SAMPLE_PATCH_INFO)
}

/// The sample sensor, paired at `paired_at`.
pub fn sample_sensor(paired_at: OffsetDateTime) -> Sensor {
    Sensor::new(sample_identity(), SAMPLE_CALIBRATION, paired_at)
}

fn sample_record(raw_glucose: u16) -> RawRecord {
    RawRecord {
        raw_glucose,
        raw_temperature: SAMPLE_RAW_TEMPERATURE,
        ..Default::default()
    }
}

/// Builder for 344-byte memory images.
#[derive(Debug, Clone)]
pub struct MemoryImageBuilder {
    identity: SensorIdentity,
    state: SensorState,
    age: u16,
    lifetime: u16,
    calibration: FactoryCalibration,
    trend_index: u8,
    history_index: u8,
    trend: [RawRecord; TREND_SLOTS],
    history: [RawRecord; HISTORY_SLOTS],
}

impl MemoryImageBuilder {
    /// Start from a ready sensor with the sample calibration.
    pub fn new(identity: SensorIdentity) -> Self {
        let record = sample_record(1000);
        Self {
            identity,
            state: SensorState::Ready,
            age: 0,
            lifetime: 14 * 24 * 60,
            calibration: SAMPLE_CALIBRATION,
            trend_index: 0,
            history_index: 0,
            trend: [record; TREND_SLOTS],
            history: [record; HISTORY_SLOTS],
        }
    }

    /// Set the state byte.
    #[must_use]
    pub fn state(mut self, state: SensorState) -> Self {
        self.state = state;
        self
    }

    /// Set the sensor age in minutes.
    #[must_use]
    pub fn age(mut self, age: u16) -> Self {
        self.age = age;
        self
    }

    /// Set the lifetime in minutes.
    #[must_use]
    pub fn lifetime(mut self, lifetime: u16) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the factory calibration.
    #[must_use]
    pub fn calibration(mut self, calibration: FactoryCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// Set the slot the next trend record is written to.
    #[must_use]
    pub fn trend_index(mut self, index: u8) -> Self {
        self.trend_index = index;
        self
    }

    /// Set the slot the next history record is written to.
    #[must_use]
    pub fn history_index(mut self, index: u8) -> Self {
        self.history_index = index;
        self
    }

    /// Use the same raw glucose for every record.
    #[must_use]
    pub fn glucose(mut self, raw_glucose: u16) -> Self {
        for record in self.trend.iter_mut().chain(self.history.iter_mut()) {
            record.raw_glucose = raw_glucose;
        }
        self
    }

    /// Replace one trend slot.
    #[must_use]
    pub fn trend_record(mut self, slot: usize, record: RawRecord) -> Self {
        if let Some(target) = self.trend.get_mut(slot) {
            *target = record;
        }
        self
    }

    /// Replace one history slot.
    #[must_use]
    pub fn history_record(mut self, slot: usize, record: RawRecord) -> Self {
        if let Some(target) = self.history.get_mut(slot) {
            *target = record;
        }
        self
    }

    /// Build the decrypted image with valid section CRCs.
    pub fn build_plain(&self) -> Result<Vec<u8>> {
        let mut memory = vec![0u8; MEMORY_IMAGE_LEN];
        memory[STATE_OFFSET] = self.state as u8;
        memory[TREND_INDEX_OFFSET] = self.trend_index;
        memory[HISTORY_INDEX_OFFSET] = self.history_index;
        memory[AGE_OFFSET..AGE_OFFSET + 2].copy_from_slice(&self.age.to_le_bytes());
        memory[LIFETIME_OFFSET..LIFETIME_OFFSET + 2].copy_from_slice(&self.lifetime.to_le_bytes());
        write_factory_calibration(&mut memory, &self.calibration)?;
        for (slot, record) in self.trend.iter().enumerate() {
            record.write_memory(&mut memory, TREND_OFFSET + slot * RECORD_LEN)?;
        }
        for (slot, record) in self.history.iter().enumerate() {
            record.write_memory(&mut memory, HISTORY_OFFSET + slot * RECORD_LEN)?;
        }
        for (_, range) in SECTIONS {
            seal_leading_crc(&mut memory[range]);
        }
        Ok(memory)
    }

    /// Build the image as stored on the sensor, encrypted for its type.
    pub fn build(&self) -> Result<Vec<u8>> {
        let plain = self.build_plain()?;
        apply_memory_cipher(
            self.identity.sensor_type(),
            &self.identity.uid,
            &self.identity.patch_info,
            &plain,
        )
    }
}

/// Builder for encrypted 46-byte streaming packets.
#[derive(Debug, Clone)]
pub struct StreamingPacketBuilder {
    uid: [u8; UID_LEN],
    seed: u16,
    age: u16,
    records: [RawRecord; STREAMING_TREND_COUNT + STREAMING_HISTORY_COUNT],
}

impl StreamingPacketBuilder {
    /// Start a packet for the sensor with `uid`.
    pub fn new(uid: [u8; UID_LEN]) -> Self {
        Self {
            uid,
            seed: 0x1234,
            age: 0,
            records: [sample_record(1000); STREAMING_TREND_COUNT + STREAMING_HISTORY_COUNT],
        }
    }

    /// Set the keystream seed carried in the first two bytes.
    #[must_use]
    pub fn seed(mut self, seed: u16) -> Self {
        self.seed = seed;
        self
    }

    /// Set the sensor age in minutes.
    #[must_use]
    pub fn age(mut self, age: u16) -> Self {
        self.age = age;
        self
    }

    /// Use the same raw glucose for every record.
    #[must_use]
    pub fn glucose(mut self, raw_glucose: u16) -> Self {
        for record in &mut self.records {
            record.raw_glucose = raw_glucose;
        }
        self
    }

    /// Replace one record: 0..7 are trend, 7..10 history, newest first.
    #[must_use]
    pub fn record(mut self, index: usize, record: RawRecord) -> Self {
        if let Some(target) = self.records.get_mut(index) {
            *target = record;
        }
        self
    }

    /// Build the decrypted 44-byte payload with its CRC.
    pub fn build_plain(&self) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; STREAMING_PAYLOAD_LEN];
        for (index, record) in self.records.iter().enumerate() {
            record.write_streaming(&mut payload, index * STREAMING_RECORD_LEN)?;
        }
        payload[STREAMING_AGE_OFFSET..STREAMING_AGE_OFFSET + 2]
            .copy_from_slice(&self.age.to_le_bytes());
        seal_trailing_crc(&mut payload);
        Ok(payload)
    }

    /// Build the encrypted packet.
    pub fn build(&self) -> Result<Vec<u8>> {
        encrypt_streaming_packet(&self.uid, self.seed, &self.build_plain()?)
    }
}

/// Split a frame into the notifications `profile` expects.
///
/// Framed profiles get a header of the data marker and the chunk index.
pub fn split_into_chunks(profile: &FamilyProfile, frame: &[u8]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::with_capacity(profile.chunk_sizes.len());
    let mut offset = 0;
    for (index, &size) in profile.chunk_sizes.iter().enumerate() {
        let payload_len = size.saturating_sub(profile.chunk_header_len);
        let end = (offset + payload_len).min(frame.len());
        let mut chunk = Vec::with_capacity(size);
        if profile.chunk_header_len > 0 {
            let mut header = vec![0u8; profile.chunk_header_len];
            header[0] = profile.chunk_marker.unwrap_or(0);
            if let Some(slot) = header.get_mut(1) {
                *slot = index as u8;
            }
            chunk.extend_from_slice(&header);
        }
        chunk.extend_from_slice(&frame[offset.min(end)..end]);
        chunks.push(chunk);
        offset = end;
    }
    chunks
}

/// A tag reader serving a fixed memory image.
///
/// # Example
///
/// ```
/// use cgm_core::mock::{MemoryImageBuilder, MockTagReader, sample_identity};
/// use cgm_core::pairing::{PairingOptions, pair};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let image = MemoryImageBuilder::new(sample_identity()).age(2000).build().unwrap();
///     let reader = MockTagReader::new(sample_identity(), image);
///
///     let result = pair(&reader, &PairingOptions::default(), &CancellationToken::new())
///         .await
///         .unwrap();
///     assert_eq!(result.sensor.age, 2000);
/// }
/// ```
pub struct MockTagReader {
    identity: SensorIdentity,
    image: Vec<u8>,
    remaining_failures: AtomicU32,
    block_reads: AtomicU32,
    latency_ms: AtomicU64,
    invalidated: AtomicBool,
}

impl std::fmt::Debug for MockTagReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTagReader")
            .field("serial", &self.identity.serial)
            .field("block_reads", &self.block_reads())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

impl MockTagReader {
    /// Create a reader for `identity` whose tag holds `image`.
    pub fn new(identity: SensorIdentity, image: Vec<u8>) -> Self {
        Self {
            identity,
            image,
            remaining_failures: AtomicU32::new(0),
            block_reads: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Delay every block read.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self
    }

    /// Make the next `count` block reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Number of block reads attempted, failed ones included.
    pub fn block_reads(&self) -> u32 {
        self.block_reads.load(Ordering::Relaxed)
    }

    /// Whether the session was ended.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TagReader for MockTagReader {
    async fn read_identity(&self) -> Result<SensorIdentity> {
        Ok(self.identity.clone())
    }

    async fn read_blocks(&self, start: u8, count: u8) -> Result<Vec<u8>> {
        self.block_reads.fetch_add(1, Ordering::Relaxed);

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failing = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Transport("tag response lost".to_string()));
        }

        let begin = usize::from(start) * BLOCK_LEN;
        let end = begin + usize::from(count) * BLOCK_LEN;
        self.image
            .get(begin..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Transport(format!("blocks {}..{} out of range", start, end)))
    }

    async fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }
}
