//! Output formatting utilities for text and JSON output.

use std::fmt::Write as _;

use anyhow::Result;
use cgm_core::calibration::factory_calibrate;
use cgm_core::parser::StreamingFrame;
use cgm_core::{ConnectionError, DomainEvent};
use cgm_types::{FactoryCalibration, Sensor, SensorFamily, SensorGlucose, SensorReading};
use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;

/// Format a timestamp as `YYYY-MM-DD HH:MM`.
#[must_use]
pub fn format_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
        .unwrap_or_else(|_| timestamp.to_string())
}

/// Format a number of minutes as days, hours and minutes.
#[must_use]
pub fn format_minutes(minutes: u16) -> String {
    let days = minutes / (24 * 60);
    let hours = minutes / 60 % 24;
    let mins = minutes % 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, mins)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

// ============================================================================
// Sensor and readings
// ============================================================================

#[derive(Debug, Serialize)]
struct SensorJson<'a> {
    serial: &'a str,
    family: String,
    sensor_type: String,
    region: String,
    state: String,
    age_minutes: u16,
    lifetime_minutes: u16,
    remaining_minutes: u16,
    calibration: &'a FactoryCalibration,
}

impl<'a> SensorJson<'a> {
    fn new(sensor: &'a Sensor) -> Self {
        Self {
            serial: sensor.serial(),
            family: sensor.family.to_string(),
            sensor_type: sensor.sensor_type.to_string(),
            region: format!("{:?}", sensor.region),
            state: sensor.state.to_string(),
            age_minutes: sensor.age,
            lifetime_minutes: sensor.lifetime,
            remaining_minutes: sensor.remaining_minutes(),
            calibration: &sensor.factory_calibration,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadingJson {
    timestamp: String,
    sensor_age: u16,
    raw_glucose: u16,
    glucose: Option<f64>,
    flags: Vec<&'static str>,
}

impl ReadingJson {
    fn new(reading: &SensorReading, calibration: &FactoryCalibration, family: SensorFamily) -> Self {
        Self {
            timestamp: format_timestamp(reading.timestamp),
            sensor_age: reading.sensor_age,
            raw_glucose: reading.raw_glucose,
            glucose: calibrated(reading, calibration, family),
            flags: reading.error.names(),
        }
    }
}

fn calibrated(
    reading: &SensorReading,
    calibration: &FactoryCalibration,
    family: SensorFamily,
) -> Option<f64> {
    reading
        .is_valid()
        .then(|| factory_calibrate(reading, calibration, family))
        .flatten()
        .map(|v| (v * 10.0).round() / 10.0)
}

fn write_readings(
    out: &mut String,
    title: &str,
    readings: &[SensorReading],
    calibration: &FactoryCalibration,
    family: SensorFamily,
) {
    let _ = writeln!(out, "\n{} ({} samples):", title, readings.len());
    for reading in readings.iter().rev() {
        let value = match calibrated(reading, calibration, family) {
            Some(v) => format!("{:>6.1} mg/dL", v),
            None => format!("{:>12}", "-"),
        };
        let _ = write!(
            out,
            "  {}  age {:>5}  raw {:>5}  {}",
            format_timestamp(reading.timestamp),
            reading.sensor_age,
            reading.raw_glucose,
            value
        );
        if !reading.error.is_ok() {
            let _ = write!(out, "  [{}]", reading.error);
        }
        out.push('\n');
    }
}

/// Text description of a sensor.
#[must_use]
pub fn format_sensor_text(sensor: &Sensor) -> String {
    let cal = &sensor.factory_calibration;
    let mut out = format!("Sensor {} ({})\n", sensor.serial(), sensor.sensor_type);
    let _ = writeln!(out, "  State:       {}", sensor.state);
    let _ = writeln!(
        out,
        "  Age:         {} ({} min)",
        format_minutes(sensor.age),
        sensor.age
    );
    let _ = writeln!(
        out,
        "  Remaining:   {} of {}",
        format_minutes(sensor.remaining_minutes()),
        format_minutes(sensor.lifetime)
    );
    let _ = writeln!(out, "  Region:      {:?}", sensor.region);
    let _ = writeln!(
        out,
        "  Calibration: i1={} i2={} i3={} i4={} i5={} i6={}",
        cal.i1, cal.i2, cal.i3, cal.i4, cal.i5, cal.i6
    );
    out
}

/// Text output of a decoded memory image.
#[must_use]
pub fn format_memory_text(
    sensor: &Sensor,
    trend: &[SensorReading],
    history: &[SensorReading],
) -> String {
    let mut out = format_sensor_text(sensor);
    let cal = &sensor.factory_calibration;
    write_readings(&mut out, "Trend", trend, cal, sensor.family);
    write_readings(&mut out, "History", history, cal, sensor.family);
    out
}

/// JSON output of a decoded memory image.
pub fn format_memory_json(
    sensor: &Sensor,
    trend: &[SensorReading],
    history: &[SensorReading],
) -> Result<String> {
    #[derive(Serialize)]
    struct MemoryJson<'a> {
        sensor: SensorJson<'a>,
        trend: Vec<ReadingJson>,
        history: Vec<ReadingJson>,
    }

    let cal = &sensor.factory_calibration;
    let rows = |readings: &[SensorReading]| -> Vec<ReadingJson> {
        readings
            .iter()
            .map(|r| ReadingJson::new(r, cal, sensor.family))
            .collect()
    };
    let json = MemoryJson {
        sensor: SensorJson::new(sensor),
        trend: rows(trend),
        history: rows(history),
    };
    Ok(serde_json::to_string_pretty(&json)? + "\n")
}

/// Text output of a decoded streaming packet.
#[must_use]
pub fn format_frame_text(
    frame: &StreamingFrame,
    calibration: &FactoryCalibration,
    family: SensorFamily,
) -> String {
    let mut out = format!(
        "Streaming packet, sensor age {} ({} min)\n",
        format_minutes(frame.age),
        frame.age
    );
    write_readings(&mut out, "Trend", &frame.trend, calibration, family);
    write_readings(&mut out, "History", &frame.history, calibration, family);
    out
}

/// JSON output of a decoded streaming packet.
pub fn format_frame_json(
    frame: &StreamingFrame,
    calibration: &FactoryCalibration,
    family: SensorFamily,
) -> Result<String> {
    #[derive(Serialize)]
    struct FrameJson {
        age_minutes: u16,
        trend: Vec<ReadingJson>,
        history: Vec<ReadingJson>,
    }

    let rows = |readings: &[SensorReading]| -> Vec<ReadingJson> {
        readings
            .iter()
            .map(|r| ReadingJson::new(r, calibration, family))
            .collect()
    };
    let json = FrameJson {
        age_minutes: frame.age,
        trend: rows(&frame.trend),
        history: rows(&frame.history),
    };
    Ok(serde_json::to_string_pretty(&json)? + "\n")
}

// ============================================================================
// Stream formatting
// ============================================================================

/// One line per glucose value.
#[must_use]
pub fn format_glucose_line(glucose: &SensorGlucose) -> String {
    let slope = glucose
        .slope
        .map(|s| format!("{:+.1}/min", s))
        .unwrap_or_default();
    let line = format!(
        "{}  {:>3} mg/dL {:<2} {}",
        format_timestamp(glucose.timestamp),
        glucose.value,
        glucose.trend.symbol(),
        slope
    );
    format!("{}\n", line.trim_end())
}

/// One JSON object per glucose value.
pub fn format_glucose_json_line(glucose: &SensorGlucose) -> Result<String> {
    #[derive(Serialize)]
    struct GlucoseJson {
        timestamp: String,
        value: u16,
        raw_value: f64,
        slope: Option<f64>,
        trend: String,
    }

    let json = GlucoseJson {
        timestamp: format_timestamp(glucose.timestamp),
        value: glucose.value,
        raw_value: (glucose.raw_value * 10.0).round() / 10.0,
        slope: glucose.slope,
        trend: format!("{:?}", glucose.trend),
    };
    Ok(serde_json::to_string(&json)? + "\n")
}

/// Status line for non-glucose events, `None` for events not shown.
#[must_use]
pub fn format_status_event(event: &DomainEvent) -> Option<String> {
    match event {
        DomainEvent::ConnectionStateChanged { state } => Some(format!("Connection: {}", state)),
        DomainEvent::SensorStateChanged { age, state } => Some(format!(
            "Sensor: {}, age {}",
            state,
            format_minutes(*age)
        )),
        DomainEvent::ConnectionErrorRaised {
            error: ConnectionError {
                message, critical, ..
            },
        } => Some(if *critical {
            format!("Error: {}", message)
        } else {
            format!("Warning: {}", message)
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgm_core::ConnectionState;
    use cgm_core::mock::sample_sensor;
    use cgm_types::TrendArrow;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn test_format_minutes() {
        assert_eq!(format_minutes(0), "0m");
        assert_eq!(format_minutes(59), "59m");
        assert_eq!(format_minutes(61), "1h 1m");
        assert_eq!(format_minutes(5000), "3d 11h 20m");
        assert_eq!(format_minutes(20160), "14d 0h 0m");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(t0()), "2023-11-14 22:13");
    }

    #[test]
    fn test_format_glucose_line() {
        let glucose = SensorGlucose {
            id: cgm_types::sample_id(&[0; 8], t0()),
            timestamp: t0(),
            raw_value: 101.05,
            value: 101,
            slope: Some(1.5),
            trend: TrendArrow::Rising,
        };
        assert_eq!(
            format_glucose_line(&glucose),
            "2023-11-14 22:13  101 mg/dL ↗  +1.5/min\n"
        );

        let first = SensorGlucose {
            slope: None,
            trend: TrendArrow::Unknown,
            ..glucose
        };
        assert!(!format_glucose_line(&first).contains("/min"));
    }

    #[test]
    fn test_format_glucose_json_line() {
        let glucose = SensorGlucose {
            id: cgm_types::sample_id(&[0; 8], t0()),
            timestamp: t0(),
            raw_value: 101.054,
            value: 101,
            slope: None,
            trend: TrendArrow::Unknown,
        };
        let line = format_glucose_json_line(&glucose).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["value"], 101);
        assert_eq!(value["raw_value"], 101.1);
        assert_eq!(value["trend"], "Unknown");
    }

    #[test]
    fn test_format_sensor_text() {
        let mut sensor = sample_sensor(t0());
        sensor.update_age(5000);
        let text = format_sensor_text(&sensor);
        assert!(text.starts_with("Sensor 3MH001DG75W"));
        assert!(text.contains("3d 11h 20m (5000 min)"));
        assert!(text.contains("i1=1 i2=300"));
    }

    #[test]
    fn test_format_status_event() {
        let line = format_status_event(&DomainEvent::ConnectionStateChanged {
            state: ConnectionState::Streaming,
        });
        assert_eq!(line.as_deref(), Some("Connection: streaming"));

        let error = ConnectionError::critical("Sensor unreachable", t0());
        let line = format_status_event(&DomainEvent::ConnectionErrorRaised { error });
        assert_eq!(line.as_deref(), Some("Error: Sensor unreachable"));

        assert!(
            format_status_event(&DomainEvent::GlucoseValuesAdded { values: vec![] }).is_none()
        );
    }
}
