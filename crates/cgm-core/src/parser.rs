//! Decoding of sensor memory images and streaming payloads.
//!
//! # Memory layout
//!
//! A decrypted memory image is 344 bytes in three CRC-protected sections:
//!
//! | Section | Bytes | Content |
//! |---------|-------|---------|
//! | header | 0..24 | CRC, calibration `i1`/`i2`, state byte at 4 |
//! | body | 24..320 | CRC, ring indexes at 26/27, 16 trend records at 28, 32 history records at 124, age at 316 |
//! | footer | 320..344 | CRC, lifetime at 326, calibration `i3`..`i6` at 0x150 |
//!
//! Each section starts with a little-endian CRC16 over the rest of it.
//! Records are 6 bytes of little-endian bit fields.
//!
//! # Streaming layout
//!
//! A decrypted streaming payload holds ten 4-byte records (7 trend, 3
//! history), the sensor age at byte 40 and a big-endian CRC at 42.

use std::ops::Range;

use bytes::Buf;
use time::{Duration, OffsetDateTime};

use cgm_types::{
    FactoryCalibration, ParseError, ParseResult, ReadingError, Sensor, SensorFamily,
    SensorIdentity, SensorReading, SensorRegion, SensorState, SensorType, UID_LEN,
    round_to_minute,
};

use crate::calibration::{MAX_TEMPERATURE, MIN_TEMPERATURE, thermistor_temperature};
use crate::codec::{leading_crc_mismatch, read_bits, write_bits};
use crate::crypto::MEMORY_IMAGE_LEN;
use crate::error::{Error, Result};

/// Minutes behind the newest trend slot for each of the 7 reported trend samples.
pub const TREND_OFFSETS: [u16; 7] = [0, 2, 4, 6, 7, 12, 15];

/// Minutes between history samples.
pub const HISTORY_INTERVAL: u16 = 15;

/// History delay of a memory image, in minutes.
pub const MEMORY_HISTORY_DELAY: u16 = 3;

/// History delay of a streaming payload, in minutes.
pub const STREAMING_HISTORY_DELAY: u16 = 2;

pub(crate) const SECTIONS: [(&str, Range<usize>); 3] =
    [("header", 0..24), ("body", 24..320), ("footer", 320..344)];

pub(crate) const STATE_OFFSET: usize = 4;
pub(crate) const TREND_INDEX_OFFSET: usize = 26;
pub(crate) const HISTORY_INDEX_OFFSET: usize = 27;
pub(crate) const TREND_OFFSET: usize = 28;
pub(crate) const TREND_SLOTS: usize = 16;
pub(crate) const HISTORY_OFFSET: usize = 124;
pub(crate) const HISTORY_SLOTS: usize = 32;
pub(crate) const RECORD_LEN: usize = 6;
pub(crate) const AGE_OFFSET: usize = 316;
pub(crate) const LIFETIME_OFFSET: usize = 326;
const CALIBRATION_OFFSET: usize = 0x150;

pub(crate) const STREAMING_RECORD_LEN: usize = 4;
pub(crate) const STREAMING_TREND_COUNT: usize = 7;
pub(crate) const STREAMING_HISTORY_COUNT: usize = 3;
pub(crate) const STREAMING_AGE_OFFSET: usize = 40;
const STREAMING_MIN_LEN: usize = 42;

/// Family, model and region of a sensor.
#[must_use]
pub fn parse_identity(patch_info: &[u8]) -> (SensorFamily, SensorType, SensorRegion) {
    (
        SensorFamily::from_patch_info(patch_info),
        SensorType::from_patch_info(patch_info),
        SensorRegion::from_patch_info(patch_info),
    )
}

fn require_len(bytes: &[u8], expected: usize) -> ParseResult<()> {
    if bytes.len() < expected {
        return Err(ParseError::InsufficientBytes {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Lifecycle state byte.
pub fn parse_state(memory: &[u8]) -> ParseResult<SensorState> {
    require_len(memory, STATE_OFFSET + 1)?;
    Ok(SensorState::from(memory[STATE_OFFSET]))
}

/// Sensor age in minutes.
pub fn parse_age(memory: &[u8]) -> ParseResult<u16> {
    require_len(memory, AGE_OFFSET + 2)?;
    Ok((&memory[AGE_OFFSET..]).get_u16_le())
}

/// Sensor lifetime in minutes.
pub fn parse_lifetime(memory: &[u8]) -> ParseResult<u16> {
    require_len(memory, LIFETIME_OFFSET + 2)?;
    Ok((&memory[LIFETIME_OFFSET..]).get_u16_le())
}

/// Per-unit factory calibration coefficients.
pub fn parse_factory_calibration(memory: &[u8]) -> ParseResult<FactoryCalibration> {
    let i1 = read_bits(memory, 2, 0, 3)? as u16;
    let i2 = read_bits(memory, 2, 3, 10)? as u16;
    let mut i3 = read_bits(memory, CALIBRATION_OFFSET, 0, 8)? as i32;
    if read_bits(memory, CALIBRATION_OFFSET, 0x21, 1)? != 0 {
        i3 = -i3;
    }
    let i4 = read_bits(memory, CALIBRATION_OFFSET, 8, 14)? as u16;
    let i5 = (read_bits(memory, CALIBRATION_OFFSET, 0x28, 12)? << 2) as u16;
    let i6 = (read_bits(memory, CALIBRATION_OFFSET, 0x34, 12)? << 2) as u16;

    Ok(FactoryCalibration {
        i1,
        i2,
        i3,
        i4,
        i5,
        i6,
    })
}

/// Write factory calibration coefficients into an image.
pub fn write_factory_calibration(
    memory: &mut [u8],
    calibration: &FactoryCalibration,
) -> ParseResult<()> {
    write_bits(memory, 2, 0, 3, u32::from(calibration.i1))?;
    write_bits(memory, 2, 3, 10, u32::from(calibration.i2))?;
    write_bits(memory, CALIBRATION_OFFSET, 0, 8, calibration.i3.unsigned_abs())?;
    write_bits(
        memory,
        CALIBRATION_OFFSET,
        0x21,
        1,
        u32::from(calibration.i3 < 0),
    )?;
    write_bits(memory, CALIBRATION_OFFSET, 8, 14, u32::from(calibration.i4))?;
    write_bits(memory, CALIBRATION_OFFSET, 0x28, 12, u32::from(calibration.i5 >> 2))?;
    write_bits(memory, CALIBRATION_OFFSET, 0x34, 12, u32::from(calibration.i6 >> 2))?;
    Ok(())
}

/// Check the CRC of every memory section.
pub fn validate_sections(memory: &[u8]) -> Result<()> {
    require_len(memory, MEMORY_IMAGE_LEN)?;
    for (name, range) in SECTIONS {
        if let Some((expected, actual)) = leading_crc_mismatch(&memory[range]) {
            return Err(Error::Integrity {
                context: name,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Undecoded fields of one measurement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawRecord {
    /// Raw glucose (14 bits).
    pub raw_glucose: u16,
    /// Quality bits (memory records only).
    pub quality: u16,
    /// Error bit (memory records only).
    pub has_error: bool,
    /// Thermistor value, scaled by 4.
    pub raw_temperature: u16,
    /// Signed thermistor adjustment, scaled by 4.
    pub temperature_adjustment: i16,
}

fn signed_adjustment(magnitude: u32, negative: bool) -> i16 {
    let value = magnitude as i16;
    if negative { -value } else { value }
}

impl RawRecord {
    /// Decode a 6-byte memory record at `offset`.
    pub fn read_memory(memory: &[u8], offset: usize) -> ParseResult<Self> {
        Ok(Self {
            raw_glucose: read_bits(memory, offset, 0, 14)? as u16,
            quality: read_bits(memory, offset, 14, 11)? as u16,
            has_error: read_bits(memory, offset, 25, 1)? != 0,
            raw_temperature: (read_bits(memory, offset, 26, 12)? << 2) as u16,
            temperature_adjustment: signed_adjustment(
                read_bits(memory, offset, 38, 9)? << 2,
                read_bits(memory, offset, 47, 1)? != 0,
            ),
        })
    }

    /// Encode as a 6-byte memory record at `offset`.
    pub fn write_memory(&self, memory: &mut [u8], offset: usize) -> ParseResult<()> {
        write_bits(memory, offset, 0, 14, u32::from(self.raw_glucose))?;
        write_bits(memory, offset, 14, 11, u32::from(self.quality))?;
        write_bits(memory, offset, 25, 1, u32::from(self.has_error))?;
        write_bits(memory, offset, 26, 12, u32::from(self.raw_temperature >> 2))?;
        write_bits(
            memory,
            offset,
            38,
            9,
            u32::from(self.temperature_adjustment.unsigned_abs() >> 2),
        )?;
        write_bits(
            memory,
            offset,
            47,
            1,
            u32::from(self.temperature_adjustment < 0),
        )?;
        Ok(())
    }

    /// Decode a 4-byte streaming record at `offset`.
    pub fn read_streaming(payload: &[u8], offset: usize) -> ParseResult<Self> {
        Ok(Self {
            raw_glucose: read_bits(payload, offset, 0, 14)? as u16,
            quality: 0,
            has_error: false,
            raw_temperature: (read_bits(payload, offset, 14, 12)? << 2) as u16,
            temperature_adjustment: signed_adjustment(
                read_bits(payload, offset, 26, 5)? << 2,
                read_bits(payload, offset, 31, 1)? != 0,
            ),
        })
    }

    /// Encode as a 4-byte streaming record at `offset`.
    pub fn write_streaming(&self, payload: &mut [u8], offset: usize) -> ParseResult<()> {
        write_bits(payload, offset, 0, 14, u32::from(self.raw_glucose))?;
        write_bits(payload, offset, 14, 12, u32::from(self.raw_temperature >> 2))?;
        write_bits(
            payload,
            offset,
            26,
            5,
            u32::from(self.temperature_adjustment.unsigned_abs() >> 2),
        )?;
        write_bits(
            payload,
            offset,
            31,
            1,
            u32::from(self.temperature_adjustment < 0),
        )?;
        Ok(())
    }

    /// Quality flags of the record under the given calibration.
    #[must_use]
    pub fn quality_flags(&self, calibration: &FactoryCalibration) -> ReadingError {
        let mut error = ReadingError::from_bits_truncate(self.quality & 0x01FF);
        if self.has_error || self.raw_glucose == 0 {
            error |= ReadingError::INVALID_DATA;
        }
        match thermistor_temperature(
            self.raw_temperature,
            self.temperature_adjustment,
            calibration,
        ) {
            None => error |= ReadingError::THERMISTOR_OUT_OF_RANGE,
            Some(t) if t < MIN_TEMPERATURE => error |= ReadingError::TEMP_LOW,
            Some(t) if t > MAX_TEMPERATURE => error |= ReadingError::TEMP_HIGH,
            Some(_) => {}
        }
        error
    }

    fn into_reading(
        self,
        uid: &[u8; UID_LEN],
        calibration: &FactoryCalibration,
        read_at: OffsetDateTime,
        age: u16,
        sample_age: u16,
    ) -> SensorReading {
        let timestamp = read_at - Duration::minutes(i64::from(age - sample_age));
        SensorReading::new(
            uid,
            timestamp,
            sample_age,
            self.raw_glucose,
            self.raw_temperature,
            self.temperature_adjustment,
            self.quality_flags(calibration),
        )
    }
}

/// Age of the `slot`-th newest history sample, if the sensor is old enough.
fn history_sample_age(age: u16, delay: u16, slot: usize) -> Option<u16> {
    let newest = age.checked_sub(delay)? / HISTORY_INTERVAL * HISTORY_INTERVAL;
    let back = u16::try_from(slot).ok()?.checked_mul(HISTORY_INTERVAL)?;
    newest.checked_sub(back)
}

/// Ring slot `back` entries before the one preceding `next_index`.
fn ring_slot(next_index: u8, back: usize, slots: usize) -> usize {
    (usize::from(next_index) % slots + slots * 2 - 1 - back % slots) % slots
}

/// Decode the trend and history rings of a memory image.
///
/// Both lists are returned oldest first. Samples that would predate sensor
/// activation are skipped.
pub fn parse_history_and_trend(
    uid: &[u8; UID_LEN],
    calibration: &FactoryCalibration,
    read_at: OffsetDateTime,
    memory: &[u8],
) -> Result<(Vec<SensorReading>, Vec<SensorReading>)> {
    require_len(memory, MEMORY_IMAGE_LEN)?;
    let read_at = round_to_minute(read_at);
    let age = parse_age(memory)?;
    let trend_index = memory[TREND_INDEX_OFFSET];
    let history_index = memory[HISTORY_INDEX_OFFSET];

    let mut trend = Vec::with_capacity(TREND_OFFSETS.len());
    for offset in TREND_OFFSETS {
        let Some(sample_age) = age.checked_sub(offset) else {
            continue;
        };
        let slot = ring_slot(trend_index, usize::from(offset), TREND_SLOTS);
        let record = RawRecord::read_memory(memory, TREND_OFFSET + slot * RECORD_LEN)?;
        trend.push(record.into_reading(uid, calibration, read_at, age, sample_age));
    }

    let mut history = Vec::with_capacity(HISTORY_SLOTS);
    for back in 0..HISTORY_SLOTS {
        let Some(sample_age) = history_sample_age(age, MEMORY_HISTORY_DELAY, back) else {
            break;
        };
        let slot = ring_slot(history_index, back, HISTORY_SLOTS);
        let record = RawRecord::read_memory(memory, HISTORY_OFFSET + slot * RECORD_LEN)?;
        history.push(record.into_reading(uid, calibration, read_at, age, sample_age));
    }

    trend.reverse();
    history.reverse();
    Ok((trend, history))
}

/// Decoded streaming payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingFrame {
    /// Sensor age in minutes.
    pub age: u16,
    /// Trend samples, oldest first.
    pub trend: Vec<SensorReading>,
    /// History samples, oldest first.
    pub history: Vec<SensorReading>,
}

/// Decode a decrypted streaming payload.
pub fn parse_streaming_frame(
    uid: &[u8; UID_LEN],
    calibration: &FactoryCalibration,
    read_at: OffsetDateTime,
    payload: &[u8],
) -> Result<StreamingFrame> {
    require_len(payload, STREAMING_MIN_LEN)?;
    let read_at = round_to_minute(read_at);
    let age = (&payload[STREAMING_AGE_OFFSET..]).get_u16_le();

    let mut trend = Vec::with_capacity(STREAMING_TREND_COUNT);
    for (index, offset) in TREND_OFFSETS.iter().enumerate() {
        let Some(sample_age) = age.checked_sub(*offset) else {
            continue;
        };
        let record = RawRecord::read_streaming(payload, index * STREAMING_RECORD_LEN)?;
        trend.push(record.into_reading(uid, calibration, read_at, age, sample_age));
    }

    let mut history = Vec::with_capacity(STREAMING_HISTORY_COUNT);
    for back in 0..STREAMING_HISTORY_COUNT {
        let Some(sample_age) = history_sample_age(age, STREAMING_HISTORY_DELAY, back) else {
            break;
        };
        let offset = (STREAMING_TREND_COUNT + back) * STREAMING_RECORD_LEN;
        let record = RawRecord::read_streaming(payload, offset)?;
        history.push(record.into_reading(uid, calibration, read_at, age, sample_age));
    }

    trend.reverse();
    history.reverse();
    Ok(StreamingFrame {
        age,
        trend,
        history,
    })
}

/// Everything decoded from one memory image.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMemory {
    /// Sensor family.
    pub family: SensorFamily,
    /// Sensor model.
    pub sensor_type: SensorType,
    /// Market region.
    pub region: SensorRegion,
    /// Lifecycle state byte.
    pub state: SensorState,
    /// Sensor age in minutes.
    pub age: u16,
    /// Lifetime in minutes.
    pub lifetime: u16,
    /// Factory calibration coefficients.
    pub calibration: FactoryCalibration,
    /// Trend samples, oldest first.
    pub trend: Vec<SensorReading>,
    /// History samples, oldest first.
    pub history: Vec<SensorReading>,
}

impl ParsedMemory {
    /// Build the host-side sensor record from the decoded image.
    #[must_use]
    pub fn to_sensor(&self, identity: SensorIdentity, read_at: OffsetDateTime) -> Sensor {
        let mut sensor =
            Sensor::new(identity, self.calibration, read_at).with_lifetime(self.lifetime);
        sensor.update_age(self.age);
        sensor.apply_state_flag(self.state);
        sensor.set_start_from(read_at);
        sensor
    }

    /// All samples, oldest first, with duplicates across trend and history removed.
    #[must_use]
    pub fn readings(&self) -> Vec<SensorReading> {
        merge_readings(&self.history, &self.trend)
    }
}

/// Merge two sample lists into one chronological list without duplicate ids.
#[must_use]
pub fn merge_readings(history: &[SensorReading], trend: &[SensorReading]) -> Vec<SensorReading> {
    let mut all: Vec<SensorReading> = history.iter().chain(trend).cloned().collect();
    all.sort_by_key(|r| r.timestamp);
    all.dedup_by_key(|r| r.id);
    all
}

/// Decode a whole decrypted memory image.
///
/// Section CRCs are validated first. Sensor types whose memory layout differs
/// from the one decoded here are rejected with [`Error::Protocol`].
pub fn parse_memory(
    identity: &SensorIdentity,
    read_at: OffsetDateTime,
    memory: &[u8],
) -> Result<ParsedMemory> {
    let (family, sensor_type, region) = parse_identity(&identity.patch_info);
    match sensor_type {
        SensorType::LibrePro | SensorType::Unknown => {
            return Err(Error::protocol(format!(
                "{} memory layout (patch info {:02X?})",
                sensor_type, identity.patch_info
            )));
        }
        _ => {}
    }

    validate_sections(memory)?;
    let calibration = parse_factory_calibration(memory)?;
    let (trend, history) = parse_history_and_trend(&identity.uid, &calibration, read_at, memory)?;

    Ok(ParsedMemory {
        family,
        sensor_type,
        region,
        state: parse_state(memory)?,
        age: parse_age(memory)?,
        lifetime: parse_lifetime(memory)?,
        calibration,
        trend,
        history,
    })
}
