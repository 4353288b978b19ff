//! Decode command implementation.
//!
//! Decrypts and parses a memory image dumped from the sensor tag. With
//! `--save` the sensor becomes the one `cgm stream` connects to, and the
//! connection state of the previous sensor is forgotten.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cgm_core::crypto::decrypt_memory_image;
use cgm_core::parser::{ParsedMemory, parse_memory};
use cgm_core::persistence::{ConnectionPersistence, FilePersistence};
use cgm_types::{Sensor, SensorIdentity};
use time::OffsetDateTime;
use tracing::info;

use crate::cli::{OutputFormat, SensorArgs};
use crate::config::{Config, SensorConfig};
use crate::format::{format_memory_json, format_memory_text};
use crate::util::{read_dump, resolve_identity, write_output};

/// Arguments for the decode command.
pub struct DecodeArgs<'a> {
    pub file: &'a PathBuf,
    pub sensor: &'a SensorArgs,
    pub format: OutputFormat,
    pub save: bool,
    pub output: Option<&'a PathBuf>,
    pub config_path: &'a Path,
}

pub fn cmd_decode(args: DecodeArgs<'_>, config: &mut Config) -> Result<()> {
    let identity = resolve_identity(args.sensor, config)?;
    let image = read_dump(args.file)?;
    let (sensor, parsed) = decode_image(identity, &image, OffsetDateTime::now_utc())
        .with_context(|| format!("Failed to decode {}", args.file.display()))?;

    let content = match args.format {
        OutputFormat::Text => format_memory_text(&sensor, &parsed.trend, &parsed.history),
        OutputFormat::Json => format_memory_json(&sensor, &parsed.trend, &parsed.history)?,
    };
    write_output(args.output, &content)?;

    if args.save {
        remember_sensor(config, &sensor, args.config_path)?;
        eprintln!(
            "Saved sensor {} to {}",
            sensor.serial(),
            args.config_path.display()
        );
    }
    Ok(())
}

/// Decrypt and parse an image read at `read_at`.
pub fn decode_image(
    identity: SensorIdentity,
    image: &[u8],
    read_at: OffsetDateTime,
) -> Result<(Sensor, ParsedMemory)> {
    let memory = decrypt_memory_image(
        identity.sensor_type(),
        &identity.uid,
        &identity.patch_info,
        image,
    )?;
    let parsed = parse_memory(&identity, read_at, &memory)?;
    let sensor = parsed.to_sensor(identity, read_at);
    Ok((sensor, parsed))
}

fn remember_sensor(config: &mut Config, sensor: &Sensor, config_path: &Path) -> Result<()> {
    let previous = config.sensor_identity().ok().flatten();
    if previous.as_ref() != Some(&sensor.identity) {
        let persistence = FilePersistence::open(config.persistence_path());
        persistence
            .reset_for_pairing()
            .context("Failed to reset connection state")?;
        info!("New sensor, connection state reset");
    }

    config.sensor = Some(SensorConfig {
        uid: hex::encode(sensor.identity.uid),
        patch_info: hex::encode(sensor.identity.patch_info),
        calibration: Some(sensor.factory_calibration),
    });
    config.save_to(config_path)
}
