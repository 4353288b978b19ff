//! Packet command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use cgm_core::crypto::decrypt_streaming_packet;
use cgm_core::parser::{StreamingFrame, parse_streaming_frame};
use cgm_types::{FactoryCalibration, SensorIdentity};
use time::OffsetDateTime;

use crate::cli::{OutputFormat, SensorArgs};
use crate::config::Config;
use crate::format::{format_frame_json, format_frame_text};
use crate::util::{parse_hex, resolve_identity, write_output};

pub fn cmd_packet(
    data: &str,
    sensor: &SensorArgs,
    format: OutputFormat,
    output: Option<&PathBuf>,
    config: &Config,
) -> Result<()> {
    let identity = resolve_identity(sensor, config)?;
    let calibration = saved_calibration(config, &identity)?;
    let packet = parse_hex(data)?;
    let frame = decode_packet(&identity, &calibration, &packet, OffsetDateTime::now_utc())?;

    let family = identity.family();
    let content = match format {
        OutputFormat::Text => format_frame_text(&frame, &calibration, family),
        OutputFormat::Json => format_frame_json(&frame, &calibration, family)?,
    };
    write_output(output, &content)
}

/// Calibration remembered for `identity` by `cgm decode --save`.
pub(super) fn saved_calibration(config: &Config, identity: &SensorIdentity) -> Result<FactoryCalibration> {
    let saved = config.sensor_identity()?;
    match (&config.sensor, saved) {
        (Some(sensor), Some(saved)) if saved == *identity => sensor.calibration.ok_or_else(|| {
            anyhow!("No factory calibration saved for sensor {}", identity.serial)
        }),
        _ => Err(anyhow!(
            "Sensor {} is not the saved sensor. Run 'cgm decode <dump> --save' for it first.",
            identity.serial
        )),
    }
}

/// Decrypt and parse one streaming packet received at `read_at`.
pub fn decode_packet(
    identity: &SensorIdentity,
    calibration: &FactoryCalibration,
    packet: &[u8],
    read_at: OffsetDateTime,
) -> Result<StreamingFrame> {
    let payload =
        decrypt_streaming_packet(&identity.uid, packet).context("Failed to decrypt packet")?;
    let frame = parse_streaming_frame(&identity.uid, calibration, read_at, &payload)?;
    Ok(frame)
}
