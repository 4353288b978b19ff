//! Utility functions for CLI operations.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use cgm_types::{PATCH_INFO_LEN, SensorIdentity, UID_LEN};

use crate::cli::SensorArgs;
use crate::config::Config;

/// Decode hex, ignoring whitespace, `:` and `-` separators and a `0x` prefix.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let cleaned: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex: {}", input.trim()))
}

fn parse_fixed<const N: usize>(input: &str, what: &str) -> Result<[u8; N]> {
    let bytes = parse_hex(input)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow!("{} must be {} bytes, got {}", what, N, len))
}

/// Parse an 8-byte sensor uid.
pub fn parse_uid(input: &str) -> Result<[u8; UID_LEN]> {
    parse_fixed(input, "Sensor uid")
}

/// Parse 6 bytes of patch info.
pub fn parse_patch_info(input: &str) -> Result<[u8; PATCH_INFO_LEN]> {
    parse_fixed(input, "Patch info")
}

/// Sensor identity from arguments, falling back to the config file.
pub fn resolve_identity(args: &SensorArgs, config: &Config) -> Result<SensorIdentity> {
    match (&args.uid, &args.patch_info) {
        (Some(uid), Some(patch_info)) => Ok(SensorIdentity::new(
            parse_uid(uid)?,
            parse_patch_info(patch_info)?,
        )),
        (None, None) => config.sensor_identity()?.ok_or_else(|| {
            anyhow!(
                "No sensor specified. Use --uid and --patch-info, or run \
                 'cgm decode <dump> --uid .. --patch-info .. --save' first."
            )
        }),
        _ => Err(anyhow!("--uid and --patch-info must be given together")),
    }
}

/// Read a dump file holding raw bytes or hex text.
pub fn read_dump(path: &PathBuf) -> Result<Vec<u8>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let is_text = bytes
        .iter()
        .all(|b| b.is_ascii_hexdigit() || b.is_ascii_whitespace() || *b == b':');
    if is_text && !bytes.is_empty() {
        parse_hex(&String::from_utf8_lossy(&bytes))
    } else {
        Ok(bytes)
    }
}

/// Write output to file or stdout.
pub fn write_output(output: Option<&PathBuf>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }
        None => {
            print!("{}", content);
            io::stdout().flush()?;
        }
    }
    Ok(())
}
