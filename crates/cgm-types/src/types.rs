//! Core types for CGM sensor data.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};

/// Length of a sensor uid in bytes.
pub const UID_LEN: usize = 8;

/// Length of the patch info block in bytes.
pub const PATCH_INFO_LEN: usize = 6;

/// Sensor hardware family, encoded in the high nibble of `patch_info[2]`.
///
/// The family selects the serial prefix, the factory calibration curve and
/// the BLE transport the sensor supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorFamily {
    /// First generation, NFC only (BLE through a transmitter bridge).
    Libre1,
    /// Professional, blinded sensor.
    LibrePro,
    /// Second generation, streams directly over BLE.
    Libre2,
    /// Sport variant of the second generation.
    LibreSense,
    /// Unrecognized family nibble.
    Unknown,
}

impl SensorFamily {
    /// Decode the family from a patch info block.
    #[must_use]
    pub fn from_patch_info(patch_info: &[u8]) -> Self {
        match patch_info.get(2).map(|b| b >> 4) {
            Some(0) => SensorFamily::Libre1,
            Some(1) => SensorFamily::LibrePro,
            Some(3) => SensorFamily::Libre2,
            Some(7) => SensorFamily::LibreSense,
            _ => SensorFamily::Unknown,
        }
    }

    /// Leading digit of the printed serial number.
    #[must_use]
    pub fn serial_prefix(&self) -> char {
        match self {
            SensorFamily::LibrePro => '1',
            SensorFamily::Libre2 => '3',
            SensorFamily::LibreSense => '7',
            SensorFamily::Libre1 | SensorFamily::Unknown => '0',
        }
    }
}

impl fmt::Display for SensorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorFamily::Libre1 => "Libre 1",
            SensorFamily::LibrePro => "Libre Pro",
            SensorFamily::Libre2 => "Libre 2",
            SensorFamily::LibreSense => "Libre Sense",
            SensorFamily::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Concrete sensor model, decoded from `patch_info[0]` (and `patch_info[3]`
/// for the 0x76 generation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorType {
    /// Libre 1 (EU).
    Libre1,
    /// Libre 14-day (US), memory encrypted.
    LibreUs14Day,
    /// Libre Pro / H.
    LibrePro,
    /// Libre 2 (EU).
    Libre2Eu,
    /// Libre 2 (US).
    Libre2Us,
    /// Libre 2 (CA).
    Libre2Ca,
    /// Libre Sense.
    LibreSense,
    /// Unrecognized model.
    Unknown,
}

impl SensorType {
    /// Decode the sensor model from a patch info block.
    #[must_use]
    pub fn from_patch_info(patch_info: &[u8]) -> Self {
        let Some(&kind) = patch_info.first() else {
            return SensorType::Unknown;
        };

        match kind {
            0xDF | 0xA2 => SensorType::Libre1,
            0xE5 | 0xE6 => SensorType::LibreUs14Day,
            0x70 => SensorType::LibrePro,
            0x9D | 0xC5 => SensorType::Libre2Eu,
            0x76 => match patch_info.get(3) {
                Some(0x02) => SensorType::Libre2Us,
                Some(0x04) => SensorType::Libre2Ca,
                _ if SensorFamily::from_patch_info(patch_info) == SensorFamily::LibreSense => {
                    SensorType::LibreSense
                }
                _ => SensorType::Unknown,
            },
            _ => SensorType::Unknown,
        }
    }

    /// Nominal wear time in minutes.
    ///
    /// The value read from sensor memory takes precedence when available.
    #[must_use]
    pub fn lifetime_minutes(&self) -> u16 {
        match self {
            SensorType::LibrePro => 15 * 24 * 60,
            _ => 14 * 24 * 60,
        }
    }

    /// Warm-up period in minutes before readings are trustworthy.
    #[must_use]
    pub fn warmup_minutes(&self) -> u16 {
        match self {
            SensorType::LibrePro => 0,
            _ => 60,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorType::Libre1 => "Libre 1",
            SensorType::LibreUs14Day => "Libre US 14 day",
            SensorType::LibrePro => "Libre Pro",
            SensorType::Libre2Eu => "Libre 2 EU",
            SensorType::Libre2Us => "Libre 2 US",
            SensorType::Libre2Ca => "Libre 2 CA",
            SensorType::LibreSense => "Libre Sense",
            SensorType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Market region, decoded from `patch_info[3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorRegion {
    /// Europe.
    European,
    /// United States.
    Usa,
    /// Australia and Canada.
    AustralianCanadian,
    /// Rest of the world.
    RestOfWorld,
    /// Unrecognized region byte.
    Unknown,
}

impl SensorRegion {
    /// Decode the region from a patch info block.
    #[must_use]
    pub fn from_patch_info(patch_info: &[u8]) -> Self {
        match patch_info.get(3) {
            Some(1) => SensorRegion::European,
            Some(2) => SensorRegion::Usa,
            Some(4) => SensorRegion::AustralianCanadian,
            Some(8) => SensorRegion::RestOfWorld,
            _ => SensorRegion::Unknown,
        }
    }
}

/// Lifecycle state of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SensorState {
    /// Sensor has not been activated.
    NotYetStarted = 1,
    /// Warm-up in progress.
    Starting = 2,
    /// Producing readings.
    Ready = 3,
    /// Wear time is over.
    Expired = 4,
    /// Sensor shut itself down after expiry.
    Shutdown = 5,
    /// Sensor reported a hardware failure.
    Failure = 6,
    /// State byte not recognized or not read yet.
    Unknown = 0,
}

impl From<u8> for SensorState {
    fn from(value: u8) -> Self {
        match value {
            1 => SensorState::NotYetStarted,
            2 => SensorState::Starting,
            3 => SensorState::Ready,
            4 => SensorState::Expired,
            5 => SensorState::Shutdown,
            6 => SensorState::Failure,
            _ => SensorState::Unknown,
        }
    }
}

impl SensorState {
    /// Terminal states are never left once entered.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SensorState::Expired | SensorState::Shutdown | SensorState::Failure
        )
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorState::NotYetStarted => "not yet started",
            SensorState::Starting => "starting",
            SensorState::Ready => "ready",
            SensorState::Expired => "expired",
            SensorState::Shutdown => "shut down",
            SensorState::Failure => "failure",
            SensorState::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Immutable identity of a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorIdentity {
    /// 8-byte uid, least significant byte first.
    pub uid: [u8; UID_LEN],
    /// 6-byte patch info block.
    pub patch_info: [u8; PATCH_INFO_LEN],
    /// Printed serial number.
    pub serial: String,
}

const SERIAL_ALPHABET: &[u8; 32] = b"0123456789ACDEFGHJKLMNPQRTUVWXYZ";

impl SensorIdentity {
    /// Build an identity, deriving the serial number from the uid.
    #[must_use]
    pub fn new(uid: [u8; UID_LEN], patch_info: [u8; PATCH_INFO_LEN]) -> Self {
        let family = SensorFamily::from_patch_info(&patch_info);
        let serial = serial_number(&uid, family);
        Self {
            uid,
            patch_info,
            serial,
        }
    }

    /// Build an identity from byte slices of arbitrary origin.
    pub fn from_slices(uid: &[u8], patch_info: &[u8]) -> ParseResult<Self> {
        let uid: [u8; UID_LEN] = uid.try_into().map_err(|_| ParseError::InsufficientBytes {
            expected: UID_LEN,
            actual: uid.len(),
        })?;
        let patch_info: [u8; PATCH_INFO_LEN] =
            patch_info
                .try_into()
                .map_err(|_| ParseError::InsufficientBytes {
                    expected: PATCH_INFO_LEN,
                    actual: patch_info.len(),
                })?;
        Ok(Self::new(uid, patch_info))
    }

    /// Sensor family from the patch info.
    #[must_use]
    pub fn family(&self) -> SensorFamily {
        SensorFamily::from_patch_info(&self.patch_info)
    }

    /// Sensor model from the patch info.
    #[must_use]
    pub fn sensor_type(&self) -> SensorType {
        SensorType::from_patch_info(&self.patch_info)
    }

    /// Market region from the patch info.
    #[must_use]
    pub fn region(&self) -> SensorRegion {
        SensorRegion::from_patch_info(&self.patch_info)
    }
}

/// Derive the printed serial number of a sensor.
///
/// The six significant uid bytes are taken most significant first and cut
/// into ten 5-bit groups, each mapped through a 32-character alphabet.
#[must_use]
pub fn serial_number(uid: &[u8; UID_LEN], family: SensorFamily) -> String {
    let b = [uid[5], uid[4], uid[3], uid[2], uid[1], uid[0]];
    let groups = [
        b[0] >> 3,
        (b[0] << 2) | (b[1] >> 6),
        b[1] >> 1,
        (b[1] << 4) | (b[2] >> 4),
        (b[2] << 1) | (b[3] >> 7),
        b[3] >> 2,
        (b[3] << 3) | (b[4] >> 5),
        b[4],
        b[5] >> 3,
        b[5] << 2,
    ];

    let mut serial = String::with_capacity(groups.len() + 1);
    serial.push(family.serial_prefix());
    for group in groups {
        serial.push(char::from(SERIAL_ALPHABET[usize::from(group & 0x1F)]));
    }
    serial
}

/// Per-unit factory calibration coefficients read from sensor memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FactoryCalibration {
    /// Curve index (1-based).
    pub i1: u16,
    /// Secondary curve coefficient.
    pub i2: u16,
    /// Raw glucose offset, sign applied.
    pub i3: i32,
    /// Raw glucose span end.
    pub i4: u16,
    /// Thermistor reference, scaled by 4.
    pub i5: u16,
    /// Thermistor offset, scaled by 4.
    pub i6: u16,
}

/// Quality flags attached to a raw sensor sample.
///
/// Any non-zero flag excludes the sample from calibration; it is still kept
/// for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ReadingError(u16);

impl ReadingError {
    /// No flag set.
    pub const OK: Self = Self(0);
    /// ADC FIFO overflow.
    pub const SD14_FIFO_OVERFLOW: Self = Self(1 << 0);
    /// Filter delta out of range.
    pub const FILTER_DELTA: Self = Self(1 << 1);
    /// Working electrode voltage out of range.
    pub const WORK_VOLTAGE: Self = Self(1 << 2);
    /// Peak delta exceeded.
    pub const PEAK_DELTA_EXCEEDED: Self = Self(1 << 3);
    /// Average delta exceeded.
    pub const AVG_DELTA_EXCEEDED: Self = Self(1 << 4);
    /// RF interference.
    pub const RF: Self = Self(1 << 5);
    /// Reference resistor out of range.
    pub const REF_R: Self = Self(1 << 6);
    /// Signal saturated.
    pub const SIGNAL_SATURATED: Self = Self(1 << 7);
    /// Signal too low.
    pub const SENSOR_SIGNAL_LOW: Self = Self(1 << 8);
    /// Thermistor reading unusable.
    pub const THERMISTOR_OUT_OF_RANGE: Self = Self(1 << 11);
    /// Skin temperature too high.
    pub const TEMP_HIGH: Self = Self(1 << 13);
    /// Skin temperature too low.
    pub const TEMP_LOW: Self = Self(1 << 14);
    /// Sample marked invalid.
    pub const INVALID_DATA: Self = Self(1 << 15);

    const NAMED: [(Self, &'static str); 13] = [
        (Self::SD14_FIFO_OVERFLOW, "SD14_FIFO_OVERFLOW"),
        (Self::FILTER_DELTA, "FILTER_DELTA"),
        (Self::WORK_VOLTAGE, "WORK_VOLTAGE"),
        (Self::PEAK_DELTA_EXCEEDED, "PEAK_DELTA_EXCEEDED"),
        (Self::AVG_DELTA_EXCEEDED, "AVG_DELTA_EXCEEDED"),
        (Self::RF, "RF"),
        (Self::REF_R, "REF_R"),
        (Self::SIGNAL_SATURATED, "SIGNAL_SATURATED"),
        (Self::SENSOR_SIGNAL_LOW, "SENSOR_SIGNAL_LOW"),
        (Self::THERMISTOR_OUT_OF_RANGE, "THERMISTOR_OUT_OF_RANGE"),
        (Self::TEMP_HIGH, "TEMP_HIGH"),
        (Self::TEMP_LOW, "TEMP_LOW"),
        (Self::INVALID_DATA, "INVALID_DATA"),
    ];

    const ALL: u16 = 0b1110_1001_1111_1111;

    /// Build from raw bits, dropping undefined ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & Self::ALL)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True when no flag is set.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True when every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every flag of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Names of the set flags, lowest bit first.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| !flag.is_ok() && self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for ReadingError {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReadingError {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ReadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

/// Truncate a timestamp to the start of its minute.
#[must_use]
pub fn round_to_minute(timestamp: OffsetDateTime) -> OffsetDateTime {
    timestamp
        - Duration::seconds(i64::from(timestamp.second()))
        - Duration::nanoseconds(i64::from(timestamp.nanosecond()))
}

/// Deterministic id of a sample: the same sensor and minute always map to
/// the same id, so re-delivered samples are idempotent downstream.
#[must_use]
pub fn sample_id(uid: &[u8; UID_LEN], timestamp: OffsetDateTime) -> Uuid {
    let minute = round_to_minute(timestamp).unix_timestamp().div_euclid(60);
    Uuid::from_u64_pair(u64::from_le_bytes(*uid), minute as u64)
}

/// One raw measurement decoded from sensor memory or a streaming packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorReading {
    /// Deterministic id (sensor uid + minute).
    pub id: Uuid,
    /// Sample time, rounded down to the minute.
    pub timestamp: OffsetDateTime,
    /// Sensor age in minutes at which the sample was taken.
    pub sensor_age: u16,
    /// Raw glucose ADC value (14 bits).
    pub raw_glucose: u16,
    /// Raw thermistor value, already scaled by 4.
    pub raw_temperature: u16,
    /// Signed thermistor adjustment, already scaled by 4.
    pub temperature_adjustment: i16,
    /// Quality flags.
    pub error: ReadingError,
}

impl SensorReading {
    /// Create a reading, deriving the id and rounding the timestamp.
    #[must_use]
    pub fn new(
        uid: &[u8; UID_LEN],
        timestamp: OffsetDateTime,
        sensor_age: u16,
        raw_glucose: u16,
        raw_temperature: u16,
        temperature_adjustment: i16,
        error: ReadingError,
    ) -> Self {
        let timestamp = round_to_minute(timestamp);
        Self {
            id: sample_id(uid, timestamp),
            timestamp,
            sensor_age,
            raw_glucose,
            raw_temperature,
            temperature_adjustment,
            error,
        }
    }

    /// Whether the reading may be calibrated.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.error.is_ok()
    }
}

/// Sensor as tracked by the host: identity plus mutable lifecycle state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sensor {
    /// Immutable identity.
    pub identity: SensorIdentity,
    /// Hardware family.
    pub family: SensorFamily,
    /// Sensor model.
    pub sensor_type: SensorType,
    /// Market region.
    pub region: SensorRegion,
    /// Factory calibration coefficients.
    pub factory_calibration: FactoryCalibration,
    /// Current lifecycle state.
    pub state: SensorState,
    /// Minutes since activation.
    pub age: u16,
    /// Wear time in minutes.
    pub lifetime: u16,
    /// Warm-up time in minutes.
    pub warmup_time: u16,
    /// When the sensor was paired with this host.
    pub pairing_timestamp: OffsetDateTime,
    /// Activation time, once known.
    pub start_timestamp: Option<OffsetDateTime>,
}

impl Sensor {
    /// Extra minutes past the lifetime a sensor may keep reporting its age.
    pub const GRACE_MINUTES: u16 = 12 * 60;

    /// Create a sensor from its identity and factory calibration.
    #[must_use]
    pub fn new(
        identity: SensorIdentity,
        factory_calibration: FactoryCalibration,
        pairing_timestamp: OffsetDateTime,
    ) -> Self {
        let sensor_type = identity.sensor_type();
        Self {
            family: identity.family(),
            sensor_type,
            region: identity.region(),
            identity,
            factory_calibration,
            state: SensorState::Unknown,
            age: 0,
            lifetime: sensor_type.lifetime_minutes(),
            warmup_time: sensor_type.warmup_minutes(),
            pairing_timestamp,
            start_timestamp: None,
        }
    }

    /// Override the nominal lifetime with the value stored on the sensor.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: u16) -> Self {
        if lifetime > 0 {
            self.lifetime = lifetime;
        }
        self
    }

    /// Printed serial number.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    /// Apply a state byte read from the sensor.
    ///
    /// Terminal states reported by the sensor are adopted; otherwise the
    /// state is re-derived from the current age. A terminal state already
    /// held is never left.
    pub fn apply_state_flag(&mut self, flag: SensorState) {
        if self.state.is_terminal() {
            return;
        }
        match flag {
            SensorState::Expired | SensorState::Shutdown | SensorState::Failure => {
                self.state = flag;
            }
            SensorState::NotYetStarted => self.state = SensorState::NotYetStarted,
            _ => {
                self.update_age(self.age);
            }
        }
    }

    /// Record a new age and derive the lifecycle state from it.
    ///
    /// Returns `true` when age or state changed.
    pub fn update_age(&mut self, age: u16) -> bool {
        let previous = (self.age, self.state);
        self.age = age.min(self.lifetime.saturating_add(Self::GRACE_MINUTES));

        self.state = match self.state {
            state if state.is_terminal() => state,
            _ if self.age >= self.lifetime => SensorState::Expired,
            SensorState::NotYetStarted if self.age == 0 => SensorState::NotYetStarted,
            _ if self.age < self.warmup_time => SensorState::Starting,
            _ => SensorState::Ready,
        };

        previous != (self.age, self.state)
    }

    /// Set the activation time from a read time and the age at that time.
    pub fn set_start_from(&mut self, read_at: OffsetDateTime) {
        if self.start_timestamp.is_none() && self.age > 0 {
            self.start_timestamp =
                Some(round_to_minute(read_at) - Duration::minutes(i64::from(self.age)));
        }
    }

    /// Minutes of wear time left.
    #[must_use]
    pub fn remaining_minutes(&self) -> u16 {
        self.lifetime.saturating_sub(self.age)
    }

    /// Whether the sensor produces usable readings.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SensorState::Ready
    }
}

/// User-entered reference point for custom calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CustomCalibrationPoint {
    /// Factory-calibrated sensor value.
    pub x: f64,
    /// Reference value (e.g. finger stick).
    pub y: f64,
}

impl CustomCalibrationPoint {
    /// Create a calibration point.
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Direction and speed of glucose change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TrendArrow {
    /// More than 3.5 per minute up.
    RapidlyRising,
    /// More than 2 per minute up.
    FastRising,
    /// More than 1 per minute up.
    Rising,
    /// Within ±1 per minute.
    Constant,
    /// Down by up to 2 per minute.
    Falling,
    /// Down by up to 3.5 per minute.
    FastFalling,
    /// Down by more than 3.5 per minute.
    RapidlyFalling,
    /// No previous value to compare against.
    #[default]
    Unknown,
}

impl TrendArrow {
    /// Classify a rate of change in mg/dL per minute.
    ///
    /// Thresholds are ±1, ±2 and ±3.5; NaN is [`TrendArrow::Unknown`].
    #[must_use]
    pub fn from_slope(slope: f64) -> Self {
        match slope {
            s if s.is_nan() => TrendArrow::Unknown,
            s if s > 3.5 => TrendArrow::RapidlyRising,
            s if s > 2.0 => TrendArrow::FastRising,
            s if s > 1.0 => TrendArrow::Rising,
            s if s >= -1.0 => TrendArrow::Constant,
            s if s >= -2.0 => TrendArrow::Falling,
            s if s >= -3.5 => TrendArrow::FastFalling,
            _ => TrendArrow::RapidlyFalling,
        }
    }

    /// Arrow symbol for terminal output.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            TrendArrow::RapidlyRising => "↑↑",
            TrendArrow::FastRising => "↑",
            TrendArrow::Rising => "↗",
            TrendArrow::Constant => "→",
            TrendArrow::Falling => "↘",
            TrendArrow::FastFalling => "↓",
            TrendArrow::RapidlyFalling => "↓↓",
            TrendArrow::Unknown => "?",
        }
    }
}

impl fmt::Display for TrendArrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Calibrated glucose value ready for display.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorGlucose {
    /// Id of the source reading.
    pub id: Uuid,
    /// Sample time.
    pub timestamp: OffsetDateTime,
    /// Factory-calibrated value before custom calibration and smoothing.
    pub raw_value: f64,
    /// Displayed value in mg/dL, clamped to the readable range.
    pub value: u16,
    /// Change per minute against the previous value.
    pub slope: Option<f64>,
    /// Trend classification of `slope`.
    pub trend: TrendArrow,
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: [u8; 8] = [0x2F, 0xE7, 0xB1, 0x00, 0x00, 0xA4, 0x07, 0xE0];
    const LIBRE2_PATCH: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

    #[test]
    fn test_family_from_patch_info() {
        assert_eq!(
            SensorFamily::from_patch_info(&LIBRE2_PATCH),
            SensorFamily::Libre2
        );
        assert_eq!(
            SensorFamily::from_patch_info(&[0xDF, 0, 0x00, 1, 0, 0]),
            SensorFamily::Libre1
        );
        assert_eq!(
            SensorFamily::from_patch_info(&[0x70, 0, 0x10, 1, 0, 0]),
            SensorFamily::LibrePro
        );
        assert_eq!(
            SensorFamily::from_patch_info(&[0x76, 0, 0x70, 8, 0, 0]),
            SensorFamily::LibreSense
        );
        assert_eq!(
            SensorFamily::from_patch_info(&[0, 0, 0x50, 0, 0, 0]),
            SensorFamily::Unknown
        );
        assert_eq!(SensorFamily::from_patch_info(&[]), SensorFamily::Unknown);
    }

    #[test]
    fn test_sensor_type_from_patch_info() {
        assert_eq!(
            SensorType::from_patch_info(&LIBRE2_PATCH),
            SensorType::Libre2Eu
        );
        assert_eq!(
            SensorType::from_patch_info(&[0xE5, 0, 0, 2, 0, 0]),
            SensorType::LibreUs14Day
        );
        assert_eq!(
            SensorType::from_patch_info(&[0x76, 0, 0x30, 0x02, 0, 0]),
            SensorType::Libre2Us
        );
        assert_eq!(
            SensorType::from_patch_info(&[0x76, 0, 0x30, 0x04, 0, 0]),
            SensorType::Libre2Ca
        );
        assert_eq!(
            SensorType::from_patch_info(&[0x76, 0, 0x70, 0x08, 0, 0]),
            SensorType::LibreSense
        );
        assert_eq!(
            SensorType::from_patch_info(&[0x76, 0, 0x30, 0x08, 0, 0]),
            SensorType::Unknown
        );
        assert_eq!(
            SensorType::from_patch_info(&[0x11, 0, 0, 0, 0, 0]),
            SensorType::Unknown
        );
    }

    #[test]
    fn test_region_from_patch_info() {
        assert_eq!(
            SensorRegion::from_patch_info(&LIBRE2_PATCH),
            SensorRegion::European
        );
        assert_eq!(
            SensorRegion::from_patch_info(&[0, 0, 0, 8, 0, 0]),
            SensorRegion::RestOfWorld
        );
        assert_eq!(
            SensorRegion::from_patch_info(&[0, 0, 0, 3, 0, 0]),
            SensorRegion::Unknown
        );
    }

    #[test]
    fn test_serial_number() {
        let identity = SensorIdentity::new(UID, LIBRE2_PATCH);
        assert_eq!(identity.serial.len(), 11);
        assert_eq!(identity.serial, "3MH001DG75W");
    }

    #[test]
    fn test_serial_number_all_zero_uid() {
        assert_eq!(
            serial_number(&[0; 8], SensorFamily::Libre1),
            "00000000000"
        );
    }

    #[test]
    fn test_identity_from_slices_rejects_short_uid() {
        let err = SensorIdentity::from_slices(&UID[..6], &LIBRE2_PATCH).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientBytes {
                expected: 8,
                actual: 6
            }
        );
    }

    #[test]
    fn test_reading_error_flags() {
        let mut error = ReadingError::OK;
        assert!(error.is_ok());
        error |= ReadingError::TEMP_LOW;
        error.insert(ReadingError::INVALID_DATA);
        assert!(!error.is_ok());
        assert!(error.contains(ReadingError::TEMP_LOW));
        assert!(!error.contains(ReadingError::TEMP_HIGH));
        assert_eq!(error.names(), vec!["TEMP_LOW", "INVALID_DATA"]);
        assert_eq!(error.to_string(), "TEMP_LOW|INVALID_DATA");
        assert_eq!(ReadingError::OK.to_string(), "OK");
    }

    #[test]
    fn test_reading_error_truncates_undefined_bits() {
        let error = ReadingError::from_bits_truncate(0xFFFF);
        assert_eq!(error.names().len(), 13);
        assert!(!error.contains(ReadingError::from_bits_truncate(1 << 9)));
        assert_eq!(error.bits() & (1 << 9), 0);
        assert_eq!(error.bits() & (1 << 10), 0);
        assert_eq!(error.bits() & (1 << 12), 0);
    }

    #[test]
    fn test_round_to_minute() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_059).unwrap()
            + Duration::milliseconds(250);
        let rounded = round_to_minute(ts);
        assert_eq!(rounded.unix_timestamp(), 1_700_000_040);
        assert_eq!(rounded.nanosecond(), 0);
    }

    #[test]
    fn test_sample_id_is_deterministic_per_minute() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_040).unwrap();
        let a = sample_id(&UID, ts);
        let b = sample_id(&UID, ts + Duration::seconds(30));
        let c = sample_id(&UID, ts + Duration::minutes(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_reading_new_rounds_timestamp() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_055).unwrap();
        let reading = SensorReading::new(&UID, ts, 100, 1500, 2428, 0, ReadingError::OK);
        assert_eq!(reading.timestamp.unix_timestamp(), 1_700_000_040);
        assert!(reading.is_valid());
    }

    fn sensor() -> Sensor {
        Sensor::new(
            SensorIdentity::new(UID, LIBRE2_PATCH),
            FactoryCalibration::default(),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn test_sensor_state_follows_age() {
        let mut sensor = sensor();
        assert_eq!(sensor.lifetime, 20160);
        assert_eq!(sensor.warmup_time, 60);

        assert!(sensor.update_age(30));
        assert_eq!(sensor.state, SensorState::Starting);

        assert!(sensor.update_age(60));
        assert_eq!(sensor.state, SensorState::Ready);
        assert!(!sensor.update_age(60));

        sensor.update_age(20160);
        assert_eq!(sensor.state, SensorState::Expired);

        // Never leaves Expired, even if a smaller age shows up.
        sensor.update_age(100);
        assert_eq!(sensor.state, SensorState::Expired);
    }

    #[test]
    fn test_sensor_age_is_capped_at_grace() {
        let mut sensor = sensor();
        sensor.update_age(u16::MAX);
        assert_eq!(sensor.age, 20160 + Sensor::GRACE_MINUTES);
        assert_eq!(sensor.remaining_minutes(), 0);
    }

    #[test]
    fn test_sensor_state_flag() {
        let mut sensor = sensor();
        sensor.update_age(500);
        sensor.apply_state_flag(SensorState::Ready);
        assert_eq!(sensor.state, SensorState::Ready);

        sensor.apply_state_flag(SensorState::Failure);
        assert_eq!(sensor.state, SensorState::Failure);

        sensor.apply_state_flag(SensorState::Ready);
        assert_eq!(sensor.state, SensorState::Failure);
    }

    #[test]
    fn test_sensor_lifetime_override() {
        let sensor = sensor().with_lifetime(21600);
        assert_eq!(sensor.lifetime, 21600);
        let sensor = sensor.with_lifetime(0);
        assert_eq!(sensor.lifetime, 21600);
    }

    #[test]
    fn test_sensor_start_timestamp() {
        let mut sensor = sensor();
        sensor.update_age(90);
        let read_at = OffsetDateTime::from_unix_timestamp(1_700_000_040).unwrap();
        sensor.set_start_from(read_at);
        assert_eq!(
            sensor.start_timestamp,
            Some(read_at - Duration::minutes(90))
        );
    }

    #[test]
    fn test_sensor_state_from_u8() {
        assert_eq!(SensorState::from(3), SensorState::Ready);
        assert_eq!(SensorState::from(6), SensorState::Failure);
        assert_eq!(SensorState::from(9), SensorState::Unknown);
    }

    #[test]
    fn test_trend_arrow_default_and_display() {
        assert_eq!(TrendArrow::default(), TrendArrow::Unknown);
        assert_eq!(TrendArrow::Constant.to_string(), "→");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_reading_error_serializes_as_bits() {
        let json = serde_json::to_string(&ReadingError::TEMP_HIGH).unwrap();
        assert_eq!(json, "8192");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_sensor_serialization_roundtrip() {
        let sensor = sensor();
        let json = serde_json::to_string(&sensor).unwrap();
        let back: Sensor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sensor);
    }
}
